use anyhow::Context;
use async_trait::async_trait;
use hearth_process::QuerySnapshot;
use serde_yaml::{Mapping, Value};

use super::{GamePlugin, PluginMetadata, Preflight, StartupCommand};
use crate::model::{InstanceConfig, InstancePaths};

const META: PluginMetadata = PluginMetadata {
    name: "BungeeCord",
    exe: "java",
    stop_command: "end",
    log_path: "proxy.log.0",
    started_trigger: "Listening on /",
    eula_trigger: None,
    manual_log: false,
    pgrep_exe: "java",
    install_script: "bungeecord_install.sh",
};

pub struct Bungeecord {
    config: InstanceConfig,
    paths: InstancePaths,
}

impl Bungeecord {
    pub fn new(config: InstanceConfig, paths: InstancePaths) -> Self {
        Self { config, paths }
    }
}

/// Points the first listener at the game port with query enabled and drops the rest.
fn rewrite_listeners(doc: &mut Value, port: u16) -> anyhow::Result<()> {
    let root = doc
        .as_mapping_mut()
        .context("config.yml root is not a mapping")?;

    let mut listener = root
        .get("listeners")
        .and_then(Value::as_sequence)
        .and_then(|s| s.first())
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_else(Mapping::new);

    listener.insert(Value::from("query_enabled"), Value::from(true));
    listener.insert(Value::from("query_port"), Value::from(port));
    listener.insert(Value::from("host"), Value::from(format!("0.0.0.0:{port}")));

    root.insert(
        Value::from("listeners"),
        Value::Sequence(vec![Value::Mapping(listener)]),
    );
    Ok(())
}

#[async_trait]
impl GamePlugin for Bungeecord {
    fn metadata(&self) -> &PluginMetadata {
        &META
    }

    async fn preflight(&self) -> anyhow::Result<Preflight> {
        super::require_jar(&self.config, &self.paths).await?;

        let path = self.paths.public.join("config.yml");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    instance = %self.config.name,
                    "config.yml not generated yet, a restart will follow the first start"
                );
                return Ok(Preflight::NeedsRestart);
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };

        let mut doc: Value = serde_yaml::from_str(&raw).context("parse config.yml")?;
        rewrite_listeners(&mut doc, self.config.gameport)?;
        let out = serde_yaml::to_string(&doc).context("serialize config.yml")?;
        tokio::fs::write(&path, out)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Preflight::Ready)
    }

    fn startup(&self) -> anyhow::Result<StartupCommand> {
        Ok(super::render_startup(META.exe, &self.config.startup.command, &self.config))
    }

    async fn query(&self) -> anyhow::Result<QuerySnapshot> {
        super::probe_reachability(&self.config.gamehost, self.config.gameport).await
    }
}
