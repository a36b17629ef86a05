use async_trait::async_trait;
use hearth_process::QuerySnapshot;

use super::{GamePlugin, PluginMetadata, Preflight, StartupCommand};
use crate::model::InstanceConfig;

const META: PluginMetadata = PluginMetadata {
    name: "Source Dedicated Server",
    exe: "./srcds_run",
    stop_command: "quit",
    log_path: "logs/console.log",
    started_trigger: "VAC secure mode is activated.",
    eula_trigger: None,
    manual_log: true,
    pgrep_exe: "srcds_linux",
    install_script: "srcds_install.sh",
};

pub struct Srcds {
    config: InstanceConfig,
}

impl Srcds {
    pub fn new(config: InstanceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GamePlugin for Srcds {
    fn metadata(&self) -> &PluginMetadata {
        &META
    }

    async fn preflight(&self) -> anyhow::Result<Preflight> {
        Ok(Preflight::Ready)
    }

    fn startup(&self) -> anyhow::Result<StartupCommand> {
        // srcds_run restarts the game on its own unless told not to.
        let command = super::with_suffix(&self.config.startup.command, "-norestart");
        Ok(super::render_startup(META.exe, &command, &self.config))
    }

    async fn query(&self) -> anyhow::Result<QuerySnapshot> {
        super::probe_reachability(&self.config.gamehost, self.config.gameport).await
    }
}
