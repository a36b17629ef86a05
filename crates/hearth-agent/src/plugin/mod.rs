//! Per-game adapters: startup templating, config preflight, status query.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_process::QuerySnapshot;

use crate::model::{InstanceConfig, InstancePaths, PluginKind};

mod bungeecord;
mod minecraft;
mod pocketmine;
mod properties;
mod query;
mod srcds;

pub use query::probe_reachability;

/// Static facts about a game type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub name: &'static str,
    /// Program launched inside the instance's working directory.
    pub exe: &'static str,
    pub stop_command: &'static str,
    /// Relative to the public directory.
    pub log_path: &'static str,
    pub started_trigger: &'static str,
    pub eula_trigger: Option<&'static str>,
    /// The daemon writes the console log itself instead of the game.
    pub manual_log: bool,
    /// Executable name used to find the real game pid.
    pub pgrep_exe: &'static str,
    pub install_script: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    /// Generated files did not exist yet; start once, stop, start again.
    NeedsRestart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StartupCommand {
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[async_trait]
pub trait GamePlugin: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    async fn preflight(&self) -> anyhow::Result<Preflight>;

    fn startup(&self) -> anyhow::Result<StartupCommand>;

    async fn query(&self) -> anyhow::Result<QuerySnapshot>;
}

/// Builds the adapter for an instance; called again after every config update.
pub trait PluginFactory: Send + Sync {
    fn build(&self, config: &InstanceConfig, paths: &InstancePaths) -> Arc<dyn GamePlugin>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPlugins;

impl PluginFactory for BuiltinPlugins {
    fn build(&self, config: &InstanceConfig, paths: &InstancePaths) -> Arc<dyn GamePlugin> {
        let config = config.clone();
        let paths = paths.clone();
        match config.plugin {
            PluginKind::Minecraft => Arc::new(minecraft::Minecraft::modern(config, paths)),
            PluginKind::MinecraftPre => Arc::new(minecraft::Minecraft::legacy(config, paths)),
            PluginKind::Bungeecord => Arc::new(bungeecord::Bungeecord::new(config, paths)),
            PluginKind::Pocketmine => Arc::new(pocketmine::Pocketmine::new(config, paths)),
            PluginKind::Srcds => Arc::new(srcds::Srcds::new(config)),
        }
    }
}

/// Substitutes `${ip}`, `${port}`, `${memory}` and every startup variable,
/// then splits on whitespace.
pub(crate) fn render_startup(exe: &str, command: &str, config: &InstanceConfig) -> StartupCommand {
    let mut line = command
        .replace("${ip}", &config.gamehost)
        .replace("${port}", &config.gameport.to_string())
        .replace("${memory}", &config.build.memory.to_string());
    for (k, v) in &config.startup.variables {
        line = line.replace(&format!("${{{k}}}"), v);
    }

    StartupCommand {
        program: exe.to_string(),
        args: line.split_whitespace().map(str::to_string).collect(),
    }
}

/// Appends `suffix` unless the command already ends with it.
pub(crate) fn with_suffix(command: &str, suffix: &str) -> String {
    let trimmed = command.trim_end();
    if trimmed.ends_with(suffix) {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        suffix.to_string()
    } else {
        format!("{trimmed} {suffix}")
    }
}

/// The jar variable must be set and point at an existing file.
pub(crate) async fn require_jar(config: &InstanceConfig, paths: &InstancePaths) -> anyhow::Result<()> {
    let Some(jar) = config.startup.variables.get("jar").filter(|j| !j.trim().is_empty()) else {
        anyhow::bail!("no startup jar is defined for this server");
    };
    let path = paths.public.join(jar);
    let is_file = tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        anyhow::bail!("{jar} does not seem to be in the server directory");
    }
    Ok(())
}
