use hearth_process::{PowerState, QuerySnapshot, ResourceUsage};
use tokio::sync::{broadcast, watch};

const CHANNEL_CAPACITY: usize = 256;

/// Frame forwarded to realtime subscribers.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerEvent {
    Status(PowerState),
    Console(String),
    Installer(String),
    Stats(ResourceUsage),
    Query(QuerySnapshot),
}

/// Typed per-instance channels; dropping a receiver unsubscribes it.
#[derive(Debug)]
pub struct EventBus {
    status: broadcast::Sender<PowerState>,
    console: broadcast::Sender<String>,
    installer: broadcast::Sender<String>,
    stats: broadcast::Sender<ResourceUsage>,
    query: broadcast::Sender<QuerySnapshot>,
    all: broadcast::Sender<ServerEvent>,
    state: watch::Sender<PowerState>,
    off_seq: watch::Sender<u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            status: broadcast::channel(CHANNEL_CAPACITY).0,
            console: broadcast::channel(CHANNEL_CAPACITY).0,
            installer: broadcast::channel(CHANNEL_CAPACITY).0,
            stats: broadcast::channel(CHANNEL_CAPACITY).0,
            query: broadcast::channel(CHANNEL_CAPACITY).0,
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            state: watch::channel(PowerState::Off).0,
            off_seq: watch::channel(0).0,
        }
    }

    /// Publishes a status change. `Crashed` is announced but never becomes
    /// the observable settled state.
    pub fn status(&self, s: PowerState) {
        let _ = self.status.send(s);
        let _ = self.all.send(ServerEvent::Status(s));
        if s != PowerState::Crashed {
            self.state.send_replace(s);
        }
    }

    pub fn console(&self, line: impl Into<String>) {
        let line = line.into();
        let _ = self.console.send(line.clone());
        let _ = self.all.send(ServerEvent::Console(line));
    }

    pub fn installer(&self, line: impl Into<String>) {
        let line = line.into();
        let _ = self.installer.send(line.clone());
        let _ = self.all.send(ServerEvent::Installer(line));
    }

    pub fn stats(&self, usage: ResourceUsage) {
        let _ = self.stats.send(usage);
        let _ = self.all.send(ServerEvent::Stats(usage));
    }

    pub fn query(&self, snapshot: QuerySnapshot) {
        let _ = self.query.send(snapshot.clone());
        let _ = self.all.send(ServerEvent::Query(snapshot));
    }

    /// Marks an `off` completion.
    pub fn off(&self) {
        self.off_seq.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<PowerState> {
        self.status.subscribe()
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<String> {
        self.console.subscribe()
    }

    pub fn subscribe_installer(&self) -> broadcast::Receiver<String> {
        self.installer.subscribe()
    }

    pub fn subscribe_stats(&self) -> broadcast::Receiver<ResourceUsage> {
        self.stats.subscribe()
    }

    pub fn subscribe_query(&self) -> broadcast::Receiver<QuerySnapshot> {
        self.query.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ServerEvent> {
        self.all.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<PowerState> {
        self.state.subscribe()
    }

    pub fn watch_off(&self) -> watch::Receiver<u64> {
        self.off_seq.subscribe()
    }
}
