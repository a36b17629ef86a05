use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = env_string(name)?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub rest: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            rest: 5656,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct UrlsConfig {
    /// Control plane endpoint notified after a successful install.
    pub install: Option<String>,
}

/// Daemon-wide settings, read once at boot.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Parent of every instance home directory (`<basepath>/<user>`).
    pub basepath: PathBuf,
    /// Directory holding one `<name>.json` record per instance.
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub scripts_dir: PathBuf,
    /// Global access keys; they hold every permission.
    pub keys: Vec<String>,
    pub docker: bool,
    pub docker_image_prefix: String,
    pub service_group: String,
    pub stop_timeout_secs: u64,
    pub query_failure_kill: bool,
    pub listen: ListenConfig,
    pub urls: UrlsConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            basepath: PathBuf::from("/srv/hearth"),
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            scripts_dir: PathBuf::from("scripts"),
            keys: Vec::new(),
            docker: true,
            docker_image_prefix: "pufferpanel".to_string(),
            service_group: "hearth".to_string(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            query_failure_kill: false,
            listen: ListenConfig::default(),
            urls: UrlsConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads `HEARTH_CONFIG` (or `./config.toml`) and applies env overrides.
    /// A missing file yields the defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = env_string("HEARTH_CONFIG").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read config {}", path.display()));
            }
        };
        Self::from_toml(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: Self = toml::from_str(raw)?;
        cfg.stop_timeout_secs = cfg.stop_timeout_secs.clamp(1, 600);
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("HEARTH_BASEPATH") {
            self.basepath = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("HEARTH_SCRIPTS_DIR") {
            self.scripts_dir = PathBuf::from(v);
        }
        if let Some(v) = env_bool("HEARTH_DOCKER") {
            self.docker = v;
        }
        if let Some(v) = env_string("HEARTH_DOCKER_IMAGE_PREFIX") {
            self.docker_image_prefix = v;
        }
        if let Some(v) = env_u64("HEARTH_STOP_TIMEOUT_SECS") {
            self.stop_timeout_secs = v.clamp(1, 600);
        }
        if let Some(v) = env_string("HEARTH_LISTEN")
            && let Some((host, port)) = v.rsplit_once(':')
            && let Ok(port) = port.parse::<u16>()
        {
            self.listen.host = host.to_string();
            self.listen.rest = port;
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.listen.host, self.listen.rest)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.listen.host, self.listen.rest))
    }
}
