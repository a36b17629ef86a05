//! Per-instance lifecycle state machine.
//!
//! `ops` serializes whole lifecycle operations (start sequence, kill,
//! rebuild, config replacement, install). `state` guards the status, the
//! live process and the counters and is never held across a call into
//! the runtime, host or plugin. Every spawned process gets a run id; tasks
//! started for a run ignore themselves once that run has ended.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hearth_process::{InstanceInfo, PowerState, QuerySnapshot, ResourceUsage};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::DaemonConfig;
use crate::events::EventBus;
use crate::files::{FileError, FileTree};
use crate::host::HostOps;
use crate::model::{ConfigError, ConfigPatch, InstanceConfig, InstancePaths};
use crate::output::{ConsoleLog, Trigger, detect_trigger, is_blank, strip_ansi};
use crate::plugin::{GamePlugin, PluginFactory, Preflight};
use crate::runtime::{RuntimeController, RuntimeError};
use crate::sampler::{UsageSource, UsageTracker};
use crate::store::ConfigStore;

mod install;

const SAMPLE_PERIOD: Duration = Duration::from_secs(2);
const QUERY_PERIOD: Duration = Duration::from_secs(10);
const CRASH_WINDOW: Duration = Duration::from_secs(60);
const MAX_STAT_ERRORS: u32 = 3;
const MAX_QUERY_ERRORS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server is not running")]
    NotRunning,
    #[error("console input is not accepted while the server is {0:?}")]
    InputRejected(PowerState),
    #[error("server config files were not generated after a restart")]
    RestartLoop,
    #[error("install script exited with code {code:?}, see {}", log.display())]
    InstallerFailed { code: Option<i32>, log: PathBuf },
    #[error("control plane notification failed: {0}")]
    Notify(#[from] reqwest::Error),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to write to the server console: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Daemon-wide knobs the supervisor needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub basepath: PathBuf,
    pub log_dir: PathBuf,
    pub stop_timeout: Duration,
    pub query_failure_kill: bool,
    pub install_url: Option<String>,
}

impl Settings {
    pub fn from_config(cfg: &DaemonConfig) -> Self {
        Self {
            basepath: cfg.basepath.clone(),
            log_dir: cfg.log_dir.clone(),
            stop_timeout: cfg.stop_timeout(),
            query_failure_kill: cfg.query_failure_kill,
            install_url: cfg.urls.install.clone(),
        }
    }
}

/// Collaborators shared by every instance on the host.
pub struct Services {
    pub runtime: Arc<dyn RuntimeController>,
    pub host: Arc<dyn HostOps>,
    pub usage: Arc<dyn UsageSource>,
    pub plugins: Arc<dyn PluginFactory>,
    pub store: ConfigStore,
    pub settings: Settings,
}

type ConsoleInput = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

struct LiveProcess {
    run_id: u64,
    pid: Option<u32>,
    input: ConsoleInput,
}

#[derive(Default)]
struct RuntimeState {
    status: PowerState,
    process: Option<LiveProcess>,
    next_run_id: u64,
    pid_locked: bool,
    tracked_pid: Option<u32>,
    last_crash: Option<Instant>,
    stat_errors: u32,
    query_errors: u32,
    rebuild_pending: bool,
    preflight_reboot: bool,
    usage: Option<ResourceUsage>,
    query: Option<QuerySnapshot>,
    timers: Vec<JoinHandle<()>>,
}

impl RuntimeState {
    fn is_current(&self, run_id: u64) -> bool {
        self.process.as_ref().is_some_and(|p| p.run_id == run_id)
    }
}

enum Launch {
    Skipped,
    Running,
    NeedsCycle,
}

pub struct Instance {
    name: String,
    config: RwLock<InstanceConfig>,
    plugin: RwLock<Arc<dyn GamePlugin>>,
    state: Mutex<RuntimeState>,
    ops: Mutex<()>,
    log: Mutex<Option<ConsoleLog>>,
    events: EventBus,
    services: Arc<Services>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(config: InstanceConfig, services: Arc<Services>) -> Arc<Self> {
        let paths = config.paths(&services.settings.basepath);
        let plugin = services.plugins.build(&config, &paths);
        Arc::new(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            plugin: RwLock::new(plugin),
            state: Mutex::new(RuntimeState::default()),
            ops: Mutex::new(()),
            log: Mutex::new(None),
            events: EventBus::new(),
            services,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn config(&self) -> InstanceConfig {
        self.config.read().await.clone()
    }

    pub async fn paths(&self) -> InstancePaths {
        self.config.read().await.paths(&self.services.settings.basepath)
    }

    pub async fn status(&self) -> PowerState {
        self.state.lock().await.status
    }

    pub async fn log_path(&self) -> PathBuf {
        let rel = self.plugin.read().await.metadata().log_path;
        self.paths().await.public.join(rel)
    }

    /// File access scoped to the server's public directory.
    pub async fn files(&self) -> FileTree {
        FileTree::new(self.paths().await.public)
    }

    pub async fn log_tail(&self, lines: usize) -> Result<String, FileError> {
        let rel = self.plugin.read().await.metadata().log_path;
        self.files().await.tail(rel, lines).await
    }

    pub async fn info(&self) -> InstanceInfo {
        let plugin = self.config.read().await.plugin.as_str().to_string();
        let st = self.state.lock().await;
        InstanceInfo {
            name: self.name.clone(),
            status: st.status,
            plugin,
            query: st.query.clone(),
            usage: st.usage,
        }
    }

    fn console_notice(&self, msg: impl AsRef<str>) {
        self.events.console(format!("[Hearth] {}\n", msg.as_ref()));
    }

    fn spawn_preflight(self: &Arc<Self>) {
        let inst = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inst.preflight().await {
                tracing::warn!(instance = %inst.name, error = %e, "automatic start failed");
            }
        });
    }

    fn spawn_kill(self: &Arc<Self>) {
        let inst = self.clone();
        tokio::spawn(async move {
            inst.kill().await;
        });
    }

    /// Starts the server when it is off; any other state is a no-op.
    ///
    /// When the plugin reports that generated files only appear after a
    /// first run, the server is started, stopped and started once more. A
    /// second such report is fatal.
    pub async fn preflight(self: &Arc<Self>) -> Result<(), SupervisorError> {
        loop {
            let launch = {
                let _op = self.ops.lock().await;
                self.start_sequence().await?
            };
            match launch {
                Launch::Skipped | Launch::Running => return Ok(()),
                Launch::NeedsCycle => {
                    tracing::info!(instance = %self.name, "config files generated, restarting once");
                    self.console_notice("Restarting your server now to officially start it.");
                    self.power_off().await?;
                }
            }
        }
    }

    async fn start_sequence(self: &Arc<Self>) -> Result<Launch, SupervisorError> {
        {
            let mut st = self.state.lock().await;
            if st.status != PowerState::Off {
                tracing::debug!(instance = %self.name, status = ?st.status, "start ignored, server is not off");
                return Ok(Launch::Skipped);
            }
            st.stat_errors = 0;
            st.query_errors = 0;
        }
        self.console_notice("Running pre-flight checks, this might take a moment...");

        let cfg = self.config.read().await.clone();
        let paths = cfg.paths(&self.services.settings.basepath);
        let plugin = self.plugin.read().await.clone();

        tracing::info!(instance = %self.name, "starting server");
        match self.launch(&cfg, &paths, plugin).await {
            Ok(launch) => Ok(launch),
            Err(e) => {
                tracing::error!(instance = %self.name, error = %e, "start sequence failed");
                self.console_notice(format!("[ERROR] {e}"));
                self.state.lock().await.preflight_reboot = false;
                Err(e)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        cfg: &InstanceConfig,
        paths: &InstancePaths,
        plugin: Arc<dyn GamePlugin>,
    ) -> Result<Launch, SupervisorError> {
        let svc = &self.services;
        svc.host.fix_permissions(cfg, paths).await?;

        let verdict = plugin.preflight().await?;
        let rebuild = {
            let mut st = self.state.lock().await;
            match verdict {
                Preflight::NeedsRestart if st.preflight_reboot => return Err(SupervisorError::RestartLoop),
                Preflight::NeedsRestart => st.preflight_reboot = true,
                Preflight::Ready => st.preflight_reboot = false,
            }
            st.rebuild_pending
        };

        if rebuild {
            self.rebuild_container(cfg, paths).await?;
        }
        svc.runtime.initialize(cfg).await?;

        let cmd = plugin.startup()?;
        tracing::info!(instance = %self.name, command = %cmd.display(), "spawning server process");
        let handle = svc.runtime.start(cfg, paths, &cmd).await?;

        let mut st = self.state.lock().await;
        let run_id = st.next_run_id;
        st.next_run_id += 1;
        st.process = Some(LiveProcess {
            run_id,
            pid: handle.pid,
            input: Arc::new(Mutex::new(handle.input)),
        });
        st.status = PowerState::Starting;
        self.events.status(PowerState::Starting);
        tokio::spawn(self.clone().run_process(run_id, handle.output, handle.exit));

        Ok(match verdict {
            Preflight::Ready => Launch::Running,
            Preflight::NeedsRestart => Launch::NeedsCycle,
        })
    }

    async fn run_process(
        self: Arc<Self>,
        run_id: u64,
        mut output: mpsc::Receiver<String>,
        exit: oneshot::Receiver<Option<i32>>,
    ) {
        while let Some(chunk) = output.recv().await {
            self.on_output(run_id, &chunk).await;
        }
        let code = exit.await.ok().flatten();

        if self.services.runtime.is_container() && self.state.lock().await.is_current(run_id) {
            let cfg = self.config.read().await.clone();
            if let Err(e) = self.services.runtime.stop(&cfg, None).await {
                tracing::debug!(instance = %self.name, error = %e, "container stop after exit failed");
            }
        }
        self.on_exit(run_id, code).await;
    }

    async fn on_output(self: &Arc<Self>, run_id: u64, chunk: &str) {
        if !self.state.lock().await.is_current(run_id) {
            return;
        }
        let clean = strip_ansi(chunk);
        let plugin = self.plugin.read().await.clone();
        let meta = plugin.metadata();

        if meta.manual_log && !is_blank(&clean) {
            let path = self.paths().await.public.join(meta.log_path);
            let mut log = self.log.lock().await;
            if log.as_ref().is_none_or(|l| l.run_id() != run_id) {
                *log = Some(ConsoleLog::new(path, run_id));
            }
            if let Some(l) = log.as_mut()
                && let Err(e) = l.write_chunk(&clean).await
            {
                tracing::warn!(instance = %self.name, path = %l.path().display(), error = %e, "console log write failed");
            }
        }

        if !is_blank(&clean) {
            self.events.console(clean.clone());
        }

        let user = self.config.read().await.user.clone();
        let mut st = self.state.lock().await;
        if st.status != PowerState::Starting || !st.is_current(run_id) {
            return;
        }
        match detect_trigger(&clean, meta.started_trigger, meta.eula_trigger) {
            Some(Trigger::Eula) => {
                st.status = PowerState::Stopping;
                self.events.status(PowerState::Stopping);
                drop(st);
                tracing::warn!(instance = %self.name, "eula not accepted, stopping server");
                self.console_notice("The server EULA has not been accepted. Stopping server.");
                self.spawn_kill();
            }
            Some(Trigger::Started) => {
                st.status = PowerState::On;
                self.events.status(PowerState::On);
                tracing::info!(instance = %self.name, "server started");

                st.timers.push(tokio::spawn(self.clone().query_loop(run_id)));
                let spawned = st.process.as_ref().and_then(|p| p.pid);
                if !st.pid_locked && spawned.is_some() && st.tracked_pid.is_none() {
                    st.pid_locked = true;
                    let inst = self.clone();
                    let exe = meta.pgrep_exe;
                    st.timers.push(tokio::spawn(async move {
                        inst.track_pid(run_id, user, exe, spawned).await;
                    }));
                }
            }
            None => {}
        }
    }

    async fn track_pid(self: Arc<Self>, run_id: u64, user: String, exe: &'static str, spawned: Option<u32>) {
        let found = match self.services.host.resolve_pid(&user, exe).await {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(instance = %self.name, error = %e, "failed to look up server pid");
                None
            }
        };
        let Some(pid) = found.or(spawned) else {
            tracing::warn!(instance = %self.name, "no pid to sample");
            return;
        };

        let mut st = self.state.lock().await;
        if !st.is_current(run_id) {
            return;
        }
        st.tracked_pid = Some(pid);
        tracing::debug!(instance = %self.name, pid, "tracking server pid");
        st.timers.push(tokio::spawn(self.clone().sample_loop(run_id, pid)));
    }

    async fn sample_loop(self: Arc<Self>, run_id: u64, pid: u32) {
        let source = self.services.usage.clone();
        let mut tracker = UsageTracker::default();
        loop {
            tokio::time::sleep(SAMPLE_PERIOD).await;
            let sample = source.sample(pid).await;

            let mut st = self.state.lock().await;
            if !st.is_current(run_id) {
                return;
            }
            match sample {
                Ok(raw) => {
                    st.stat_errors = 0;
                    let usage = tracker.observe(raw, Instant::now(), source.ticks_per_sec());
                    st.usage = Some(usage);
                    self.events.stats(usage);
                }
                Err(e) => {
                    st.stat_errors += 1;
                    let n = st.stat_errors;
                    drop(st);
                    tracing::warn!(instance = %self.name, pid, errors = n, error = %e, "resource sample failed");
                    if n >= MAX_STAT_ERRORS {
                        tracing::error!(instance = %self.name, "server is unresponsive, killing");
                        self.console_notice("[WARNING] Server process is unresponsive. Killing server.");
                        self.spawn_kill();
                        return;
                    }
                }
            }
        }
    }

    async fn query_loop(self: Arc<Self>, run_id: u64) {
        loop {
            tokio::time::sleep(QUERY_PERIOD).await;
            let plugin = self.plugin.read().await.clone();
            let result = plugin.query().await;

            let mut st = self.state.lock().await;
            if !st.is_current(run_id) {
                return;
            }
            match result {
                Ok(snapshot) => {
                    st.query_errors = 0;
                    st.query = Some(snapshot.clone());
                    self.events.query(snapshot);
                }
                Err(e) => {
                    st.query_errors += 1;
                    let n = st.query_errors;
                    drop(st);
                    tracing::debug!(instance = %self.name, errors = n, error = %e, "server query failed");
                    if n >= MAX_QUERY_ERRORS && self.services.settings.query_failure_kill {
                        tracing::error!(instance = %self.name, "server stopped answering queries, killing");
                        self.spawn_kill();
                        return;
                    }
                }
            }
        }
    }

    async fn on_exit(self: &Arc<Self>, run_id: u64, code: Option<i32>) {
        let mut st = self.state.lock().await;
        if !st.is_current(run_id) {
            return;
        }

        let crashed = matches!(st.status, PowerState::Starting | PowerState::On);
        if crashed {
            tracing::warn!(instance = %self.name, ?code, "server process exited unexpectedly");
            self.events.status(PowerState::Crashed);
        } else {
            tracing::info!(instance = %self.name, ?code, "server process stopped");
        }
        let ended = self.settle_off(&mut st);

        let mut restart = false;
        if crashed {
            let now = Instant::now();
            let frequent = st.last_crash.is_some_and(|t| now.duration_since(t) < CRASH_WINDOW);
            if !frequent {
                st.last_crash = Some(now);
                restart = true;
            }
        }
        drop(st);
        self.finish_off(ended).await;

        if crashed && restart {
            tracing::warn!(instance = %self.name, "restarting server after crash");
            self.console_notice("[WARNING] Server crashed. Restarting now.");
            self.spawn_preflight();
        } else if crashed {
            tracing::warn!(instance = %self.name, "crashed again within a minute, not restarting");
            self.console_notice(
                "[WARNING] Server crashed again less than 60 seconds after the previous crash. Automatic restart skipped.",
            );
        }
    }

    /// Moves to `Off` and drops everything tied to the run. Returns the
    /// ended run id.
    fn settle_off(&self, st: &mut RuntimeState) -> Option<u64> {
        for t in st.timers.drain(..) {
            t.abort();
        }
        st.usage = None;
        st.query = None;
        st.pid_locked = false;
        st.tracked_pid = None;
        st.stat_errors = 0;
        st.query_errors = 0;
        let ended = st.process.take().map(|p| p.run_id);
        if st.status != PowerState::Off {
            st.status = PowerState::Off;
            self.events.status(PowerState::Off);
        }
        ended
    }

    async fn finish_off(&self, ended: Option<u64>) {
        if let Some(run_id) = ended {
            let log = {
                let mut guard = self.log.lock().await;
                if guard.as_ref().is_some_and(|l| l.run_id() == run_id) {
                    guard.take()
                } else {
                    None
                }
            };
            if let Some(log) = log {
                log.close().await;
            }
        }
        self.events.off();
    }

    /// Asks the server to stop and waits for it; escalates to `kill` after
    /// the configured stop timeout.
    pub async fn power_off(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut off = self.events.watch_off();

        {
            let _op = self.ops.lock().await;
            // Completions from runs that ended while queued behind `ops`
            // must not satisfy this wait.
            let _ = off.borrow_and_update();
            let (input, pid) = {
                let mut st = self.state.lock().await;
                if st.status == PowerState::Off {
                    tracing::debug!(instance = %self.name, "power off requested but server is already off");
                    return Ok(());
                }
                if st.status != PowerState::Stopping {
                    st.status = PowerState::Stopping;
                    self.events.status(PowerState::Stopping);
                }
                match st.process.as_ref() {
                    Some(p) => (p.input.clone(), p.pid),
                    None => return Ok(()),
                }
            };

            tracing::info!(instance = %self.name, ?pid, "stopping server");
            let result = if self.services.runtime.is_container() {
                let cfg = self.config.read().await.clone();
                self.services.runtime.stop(&cfg, pid).await.map_err(SupervisorError::from)
            } else {
                let stop = self.plugin.read().await.metadata().stop_command;
                write_line(&input, stop).await.map_err(SupervisorError::from)
            };
            if let Err(e) = result {
                tracing::warn!(instance = %self.name, error = %e, "graceful stop failed, killing");
                self.kill_locked().await;
                return Ok(());
            }
        }

        let timeout = self.services.settings.stop_timeout;
        if tokio::time::timeout(timeout, off.changed()).await.is_err() {
            tracing::warn!(instance = %self.name, timeout_secs = timeout.as_secs(), "server did not stop in time, killing");
            self.console_notice("[WARNING] Server did not stop in time. Killing server.");
            self.kill().await;
        }
        Ok(())
    }

    pub async fn power_cycle(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.power_off().await?;
        self.preflight().await
    }

    /// Forced termination. Backend failures are logged; the instance always
    /// ends `Off` with an `off` completion.
    pub async fn kill(self: &Arc<Self>) {
        let _op = self.ops.lock().await;
        self.kill_locked().await;
    }

    async fn kill_locked(&self) {
        let pid = self.state.lock().await.process.as_ref().and_then(|p| p.pid);
        let cfg = self.config.read().await.clone();
        tracing::info!(instance = %self.name, ?pid, "killing server");
        if let Err(e) = self.services.runtime.kill(&cfg, pid).await {
            tracing::warn!(instance = %self.name, error = %e, "kill failed");
        }
        let ended = {
            let mut st = self.state.lock().await;
            self.settle_off(&mut st)
        };
        self.finish_off(ended).await;
    }

    /// Writes one line to the server console.
    pub async fn send_command(&self, line: &str) -> Result<(), SupervisorError> {
        let stop = self.plugin.read().await.metadata().stop_command;
        let input = {
            let mut st = self.state.lock().await;
            match st.status {
                PowerState::Off => return Err(SupervisorError::NotRunning),
                PowerState::Stopping => return Err(SupervisorError::InputRejected(PowerState::Stopping)),
                _ => {}
            }
            let Some(p) = st.process.as_ref() else {
                return Err(SupervisorError::NotRunning);
            };
            let input = p.input.clone();
            if line.trim() == stop {
                st.status = PowerState::Stopping;
                self.events.status(PowerState::Stopping);
                tracing::info!(instance = %self.name, "stop command sent from console");
            }
            input
        };
        write_line(&input, line.trim_end_matches(['\r', '\n'])).await?;
        Ok(())
    }

    /// Recreates the container now when off, otherwise on the next start.
    pub async fn rebuild(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _op = self.ops.lock().await;
        let status = {
            let mut st = self.state.lock().await;
            if st.status != PowerState::Off {
                st.rebuild_pending = true;
            }
            st.status
        };
        if status != PowerState::Off {
            tracing::info!(instance = %self.name, "container rebuild scheduled for next start");
            self.console_notice("Container rebuild scheduled for the next server start.");
            return Ok(());
        }
        let cfg = self.config.read().await.clone();
        let paths = cfg.paths(&self.services.settings.basepath);
        self.rebuild_container(&cfg, &paths).await
    }

    async fn rebuild_container(&self, cfg: &InstanceConfig, paths: &InstancePaths) -> Result<(), SupervisorError> {
        let runtime = &self.services.runtime;
        self.console_notice("Rebuilding server container...");
        tracing::info!(instance = %self.name, "rebuilding container");
        if let Err(e) = runtime.delete(cfg).await {
            tracing::warn!(instance = %self.name, error = %e, "container delete failed during rebuild");
        }
        match runtime.create(cfg, paths).await {
            Ok(()) => {
                self.state.lock().await.rebuild_pending = false;
                self.console_notice("Server container rebuilt.");
                Ok(())
            }
            Err(e) => {
                self.state.lock().await.rebuild_pending = true;
                Err(e.into())
            }
        }
    }

    /// Applies a validated patch, persists it and rebuilds the plugin.
    pub async fn update_config(self: &Arc<Self>, patch: &ConfigPatch) -> Result<InstanceConfig, SupervisorError> {
        let _op = self.ops.lock().await;
        let next = self.config.read().await.apply_patch(patch)?;
        self.replace_config(next).await
    }

    /// Persists and swaps in a new configuration. Caller holds `ops`.
    async fn store_config(&self, next: InstanceConfig) -> Result<InstancePaths, SupervisorError> {
        self.services.store.save(&next).await?;
        let paths = next.paths(&self.services.settings.basepath);
        let plugin = self.services.plugins.build(&next, &paths);
        *self.config.write().await = next;
        *self.plugin.write().await = plugin;
        tracing::info!(instance = %self.name, "configuration updated");
        Ok(paths)
    }

    /// Caller holds `ops`.
    async fn replace_config(&self, next: InstanceConfig) -> Result<InstanceConfig, SupervisorError> {
        let paths = self.store_config(next.clone()).await?;
        let off = {
            let mut st = self.state.lock().await;
            if st.status != PowerState::Off {
                st.rebuild_pending = true;
            }
            st.status == PowerState::Off
        };
        if off && let Err(e) = self.rebuild_container(&next, &paths).await {
            tracing::warn!(instance = %self.name, error = %e, "rebuild after config update failed, retrying on next start");
        }
        Ok(next)
    }
}

async fn write_line(input: &ConsoleInput, line: &str) -> std::io::Result<()> {
    let mut w = input.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

#[cfg(test)]
pub(crate) mod testing;
