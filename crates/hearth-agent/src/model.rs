use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be non-empty")]
    Empty { field: &'static str },
    #[error("invalid {field}: only [A-Za-z0-9._-] are allowed")]
    Invalid { field: &'static str },
    #[error("gameport must be non-zero")]
    ZeroPort,
    #[error("build.memory must be greater than zero")]
    ZeroMemory,
    #[error("instance name cannot be changed by a config update")]
    NameChanged,
    #[error("patch path segment {0:?} does not address an object")]
    BadPatchPath(String),
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Configuration key the error refers to, when there is one.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Empty { field } | Self::Invalid { field } => Some(*field),
            Self::ZeroPort => Some("gameport"),
            Self::ZeroMemory => Some("build.memory"),
            Self::NameChanged => Some("name"),
            Self::BadPatchPath(_) => Some("object"),
            Self::Parse(_) => None,
        }
    }
}

/// Keeps names safe as file names, container names and account names.
pub fn normalize_name(raw: &str, field: &'static str) -> Result<String, ConfigError> {
    let v = raw.trim();
    if v.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    if v == "." || v == ".." {
        return Err(ConfigError::Invalid { field });
    }
    if !v
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ConfigError::Invalid { field });
    }
    Ok(v.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    Minecraft,
    MinecraftPre,
    Bungeecord,
    Pocketmine,
    Srcds,
}

impl PluginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minecraft => "minecraft",
            Self::MinecraftPre => "minecraft-pre",
            Self::Bungeecord => "bungeecord",
            Self::Pocketmine => "pocketmine",
            Self::Srcds => "srcds",
        }
    }

    /// Container base image family; proxies and legacy servers share the minecraft image.
    pub fn image_family(self) -> &'static str {
        match self {
            Self::Minecraft | Self::MinecraftPre | Self::Bungeecord => "minecraft",
            Self::Pocketmine => "pocketmine",
            Self::Srcds => "srcds",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BuildConfig {
    /// Megabytes.
    pub memory: u64,
    /// Percent of one core; zero or negative means unlimited.
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub io: Option<u32>,
    /// host ip -> internal port -> external port
    #[serde(default)]
    pub mapping: BTreeMap<String, BTreeMap<u16, u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StartupConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Durable per-instance record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub user: String,
    pub plugin: PluginKind,
    pub gamehost: String,
    pub gameport: u16,
    pub build: BuildConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    /// access token -> granted permissions (`s:get`, `s:power`, ...)
    #[serde(default)]
    pub keys: BTreeMap<String, Vec<String>>,
}

impl InstanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_name(&self.name, "name")?;
        normalize_name(&self.user, "user")?;
        if self.gamehost.trim().is_empty() {
            return Err(ConfigError::Empty { field: "gamehost" });
        }
        if self.gameport == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.build.memory == 0 {
            return Err(ConfigError::ZeroMemory);
        }
        Ok(())
    }

    pub fn paths(&self, basepath: &Path) -> InstancePaths {
        let root = basepath.join(&self.user);
        InstancePaths {
            public: root.join("public"),
            root,
        }
    }

    /// Global keys hold every permission; instance keys hold what they list.
    pub fn has_permission(&self, global_keys: &[String], token: &str, permission: &str) -> bool {
        if global_keys.iter().any(|k| k == token) {
            return true;
        }
        self.keys
            .get(token)
            .is_some_and(|perms| perms.iter().any(|p| p == permission))
    }

    /// Produces the patched configuration without touching `self`.
    pub fn apply_patch(&self, patch: &ConfigPatch) -> Result<InstanceConfig, ConfigError> {
        let mut root = serde_json::to_value(self)?;

        let mut target = &mut root;
        for seg in &patch.path {
            let obj = target
                .as_object_mut()
                .ok_or_else(|| ConfigError::BadPatchPath(seg.clone()))?;
            target = obj
                .entry(seg.clone())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }

        let merge = !patch.overwrite && patch.value.is_object() && target.is_object();
        if merge {
            if let (Some(existing), Some(incoming)) = (target.as_object_mut(), patch.value.as_object()) {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
        } else {
            *target = patch.value.clone();
        }

        let next: InstanceConfig = serde_json::from_value(root)?;
        if next.name != self.name {
            return Err(ConfigError::NameChanged);
        }
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    /// `<basepath>/<user>`
    pub root: PathBuf,
    /// `<basepath>/<user>/public`, the game server's working directory.
    pub public: PathBuf,
}

/// Typed replacement for the legacy `child:parent` merge request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPatch {
    /// Object keys from the config root down to the replaced node.
    pub path: Vec<String>,
    pub value: serde_json::Value,
    pub overwrite: bool,
}

impl ConfigPatch {
    /// `object` uses the legacy innermost-first form, e.g. `mapping:build`.
    pub fn from_legacy(object: Option<&str>, value: serde_json::Value, overwrite: bool) -> Self {
        let path = object
            .map(|o| {
                o.split(':')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .rev()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            path,
            value,
            overwrite,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_config(name: &str) -> InstanceConfig {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "user": name,
        "plugin": "minecraft",
        "gamehost": "127.0.0.1",
        "gameport": 25565,
        "build": {
            "memory": 1024,
            "cpu": 100,
            "io": 500,
            "mapping": { "127.0.0.1": { "25566": 25567 } }
        },
        "startup": {
            "command": "-Xmx${memory}M -jar ${jar}",
            "variables": { "jar": "server.jar" }
        },
        "keys": { "tok": ["s:get", "s:console"] }
    }))
    .unwrap()
}
