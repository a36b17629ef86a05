use specta::Type;

/// Power state of a managed instance as published to subscribers.
///
/// NOTE: `Crashed` is never stored; it is emitted once before the
/// instance settles in `Off`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    #[default]
    Off,
    Starting,
    On,
    Stopping,
    Crashed,
}

impl PowerState {
    /// States in which a live process handle exists.
    pub fn has_process(self) -> bool {
        matches!(self, Self::Starting | Self::On | Self::Stopping)
    }

    /// Legacy numeric code used by older control panels.
    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::Starting => 2,
            Self::Stopping => 3,
            Self::Crashed => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ResourceUsage {
    /// Whole percent of one core; may exceed 100 on multi-core usage.
    pub cpu_percent: u32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct QuerySnapshot {
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numplayers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxplayers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,
    #[serde(default)]
    pub players: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Unix milliseconds when the snapshot was taken.
    pub time: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceInfo {
    pub name: String,
    pub status: PowerState,
    pub plugin: String,
    pub query: Option<QuerySnapshot>,
    #[serde(rename = "proc")]
    pub usage: Option<ResourceUsage>,
}
