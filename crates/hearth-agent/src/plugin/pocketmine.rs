use async_trait::async_trait;
use hearth_process::QuerySnapshot;

use super::{GamePlugin, PluginMetadata, Preflight, StartupCommand, properties};
use crate::model::{InstanceConfig, InstancePaths};

const META: PluginMetadata = PluginMetadata {
    name: "PocketMine-MP",
    exe: "php",
    stop_command: "stop",
    log_path: "server.log",
    started_trigger: ")! For help, type \"help\" or \"?\"",
    eula_trigger: None,
    manual_log: false,
    pgrep_exe: "php",
    install_script: "pocketmine_install.sh",
};

const REQUIRED_FLAGS: &str = "--disable-ansi --no-wizard";

pub struct Pocketmine {
    config: InstanceConfig,
    paths: InstancePaths,
}

impl Pocketmine {
    pub fn new(config: InstanceConfig, paths: InstancePaths) -> Self {
        Self { config, paths }
    }
}

#[async_trait]
impl GamePlugin for Pocketmine {
    fn metadata(&self) -> &PluginMetadata {
        &META
    }

    async fn preflight(&self) -> anyhow::Result<Preflight> {
        let found = properties::update_file(
            &self.paths.public.join("server.properties"),
            &[
                ("enable-query", "on".to_string()),
                ("server-port", self.config.gameport.to_string()),
                ("memory-limit", format!("{}M", self.config.build.memory)),
            ],
        )
        .await?;
        Ok(if found {
            Preflight::Ready
        } else {
            Preflight::NeedsRestart
        })
    }

    fn startup(&self) -> anyhow::Result<StartupCommand> {
        let command = super::with_suffix(&self.config.startup.command, REQUIRED_FLAGS);
        Ok(super::render_startup(META.exe, &command, &self.config))
    }

    async fn query(&self) -> anyhow::Result<QuerySnapshot> {
        super::probe_reachability(&self.config.gamehost, self.config.gameport).await
    }
}
