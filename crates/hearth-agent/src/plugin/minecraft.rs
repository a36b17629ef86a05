use async_trait::async_trait;
use hearth_process::QuerySnapshot;

use super::{GamePlugin, PluginMetadata, Preflight, StartupCommand, properties};
use crate::model::{InstanceConfig, InstancePaths};

const MODERN: PluginMetadata = PluginMetadata {
    name: "Minecraft",
    exe: "java",
    stop_command: "stop",
    log_path: "logs/latest.log",
    started_trigger: ")! For help, type ",
    eula_trigger: Some("Go to eula.txt for more info."),
    manual_log: false,
    pgrep_exe: "java",
    install_script: "minecraft_install.sh",
};

// Pre-1.7 servers log to server.log and have no EULA gate.
const LEGACY: PluginMetadata = PluginMetadata {
    name: "Minecraft (legacy)",
    exe: "java",
    stop_command: "stop",
    log_path: "server.log",
    started_trigger: "Done (",
    eula_trigger: None,
    manual_log: false,
    pgrep_exe: "java",
    install_script: "minecraft_install.sh",
};

pub struct Minecraft {
    config: InstanceConfig,
    paths: InstancePaths,
    meta: PluginMetadata,
}

impl Minecraft {
    pub fn modern(config: InstanceConfig, paths: InstancePaths) -> Self {
        Self {
            config,
            paths,
            meta: MODERN,
        }
    }

    pub fn legacy(config: InstanceConfig, paths: InstancePaths) -> Self {
        Self {
            config,
            paths,
            meta: LEGACY,
        }
    }
}

#[async_trait]
impl GamePlugin for Minecraft {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    async fn preflight(&self) -> anyhow::Result<Preflight> {
        super::require_jar(&self.config, &self.paths).await?;

        let port = self.config.gameport.to_string();
        let found = properties::update_file(
            &self.paths.public.join("server.properties"),
            &[
                ("enable-query", "true".to_string()),
                ("server-port", port.clone()),
                ("server-ip", "0.0.0.0".to_string()),
                ("query.port", port),
            ],
        )
        .await?;

        if !found {
            tracing::warn!(
                instance = %self.config.name,
                "server.properties not generated yet, a restart will follow the first start"
            );
            return Ok(Preflight::NeedsRestart);
        }
        Ok(Preflight::Ready)
    }

    fn startup(&self) -> anyhow::Result<StartupCommand> {
        Ok(super::render_startup(
            self.meta.exe,
            &self.config.startup.command,
            &self.config,
        ))
    }

    async fn query(&self) -> anyhow::Result<QuerySnapshot> {
        super::probe_reachability(&self.config.gamehost, self.config.gameport).await
    }
}
