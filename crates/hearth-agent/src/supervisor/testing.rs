//! In-memory collaborators for supervisor, registry and API tests.

use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use hearth_process::{PowerState, QuerySnapshot};
use tokio::io::AsyncWrite;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{Instance, Services, Settings};
use crate::host::HostOps;
use crate::model::{InstanceConfig, InstancePaths, sample_config};
use crate::plugin::{GamePlugin, PluginFactory, PluginMetadata, Preflight, StartupCommand};
use crate::runtime::{ProcessHandle, RuntimeController, RuntimeError};
use crate::sampler::{RawUsage, UsageSource};
use crate::store::ConfigStore;

const PID_BASE: u32 = 1000;

struct Recorder(Arc<StdMutex<Vec<u8>>>);

impl AsyncWrite for Recorder {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct FakeProc {
    out: Option<mpsc::Sender<String>>,
    exit: Option<oneshot::Sender<Option<i32>>>,
    input: Arc<StdMutex<Vec<u8>>>,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    container: bool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub kills: AtomicUsize,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
    fail_kill: AtomicBool,
    fail_start: AtomicBool,
    procs: StdMutex<Vec<FakeProc>>,
}

impl FakeRuntime {
    pub fn count(&self, c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }

    pub fn set_fail_kill(&self, v: bool) {
        self.fail_kill.store(v, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, v: bool) {
        self.fail_start.store(v, Ordering::SeqCst);
    }

    /// Sends one output chunk from the `idx`-th spawned process.
    pub async fn emit(&self, idx: usize, chunk: &str) {
        let tx = self.procs.lock().unwrap().get(idx).and_then(|p| p.out.clone());
        if let Some(tx) = tx {
            let _ = tx.send(chunk.to_string()).await;
        }
    }

    pub fn exit(&self, idx: usize, code: Option<i32>) {
        let mut procs = self.procs.lock().unwrap();
        if let Some(p) = procs.get_mut(idx) {
            p.out = None;
            if let Some(tx) = p.exit.take() {
                let _ = tx.send(code);
            }
        }
    }

    pub fn input(&self, idx: usize) -> String {
        let procs = self.procs.lock().unwrap();
        procs
            .get(idx)
            .map(|p| String::from_utf8_lossy(&p.input.lock().unwrap()).into_owned())
            .unwrap_or_default()
    }

    fn end_pid(&self, pid: Option<u32>) {
        if let Some(pid) = pid {
            self.exit(pid.saturating_sub(PID_BASE) as usize, None);
        }
    }
}

#[async_trait]
impl RuntimeController for FakeRuntime {
    fn is_container(&self) -> bool {
        self.container
    }

    async fn initialize(&self, _cfg: &InstanceConfig) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create(&self, _cfg: &InstanceConfig, _paths: &InstancePaths) -> Result<(), RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(
        &self,
        _cfg: &InstanceConfig,
        _paths: &InstancePaths,
        _cmd: &StartupCommand,
    ) -> Result<ProcessHandle, RuntimeError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Spawn {
                command: "game".to_string(),
                source: std::io::Error::other("no such container"),
            });
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        let (out_tx, output) = mpsc::channel(64);
        let (exit_tx, exit) = oneshot::channel();
        let input = Arc::new(StdMutex::new(Vec::new()));
        let mut procs = self.procs.lock().unwrap();
        let pid = PID_BASE + procs.len() as u32;
        procs.push(FakeProc {
            out: Some(out_tx),
            exit: Some(exit_tx),
            input: input.clone(),
        });
        Ok(ProcessHandle {
            pid: Some(pid),
            input: Box::new(Recorder(input)),
            output,
            exit,
        })
    }

    async fn stop(&self, _cfg: &InstanceConfig, pid: Option<u32>) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.end_pid(pid);
        Ok(())
    }

    async fn kill(&self, _cfg: &InstanceConfig, pid: Option<u32>) -> Result<(), RuntimeError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(RuntimeError::NoProcess);
        }
        self.end_pid(pid);
        Ok(())
    }

    async fn delete(&self, _cfg: &InstanceConfig) -> Result<(), RuntimeError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakePlugin {
    meta: PluginMetadata,
    verdicts: StdMutex<VecDeque<Preflight>>,
    preflight_fail: AtomicBool,
    query_fail: AtomicBool,
}

impl FakePlugin {
    fn new(manual_log: bool) -> Self {
        Self {
            meta: PluginMetadata {
                name: "fake",
                exe: "game",
                stop_command: "stop",
                log_path: "logs/console.log",
                started_trigger: "Done!",
                eula_trigger: Some("agree to the EULA"),
                manual_log,
                pgrep_exe: "game",
                install_script: "fake_install.sh",
            },
            verdicts: StdMutex::new(VecDeque::new()),
            preflight_fail: AtomicBool::new(false),
            query_fail: AtomicBool::new(false),
        }
    }

    /// Preflight answers, consumed in order; `Ready` once exhausted.
    pub fn queue(&self, verdicts: impl IntoIterator<Item = Preflight>) {
        self.verdicts.lock().unwrap().extend(verdicts);
    }

    pub fn set_preflight_fail(&self, v: bool) {
        self.preflight_fail.store(v, Ordering::SeqCst);
    }

    pub fn set_query_fail(&self, v: bool) {
        self.query_fail.store(v, Ordering::SeqCst);
    }
}

#[async_trait]
impl GamePlugin for FakePlugin {
    fn metadata(&self) -> &PluginMetadata {
        &self.meta
    }

    async fn preflight(&self) -> anyhow::Result<Preflight> {
        if self.preflight_fail.load(Ordering::SeqCst) {
            anyhow::bail!("server.jar does not seem to be in the server directory");
        }
        Ok(self.verdicts.lock().unwrap().pop_front().unwrap_or(Preflight::Ready))
    }

    fn startup(&self) -> anyhow::Result<StartupCommand> {
        Ok(StartupCommand {
            program: "game".to_string(),
            args: vec!["--nogui".to_string()],
        })
    }

    async fn query(&self) -> anyhow::Result<QuerySnapshot> {
        if self.query_fail.load(Ordering::SeqCst) {
            anyhow::bail!("timed out");
        }
        Ok(QuerySnapshot {
            online: true,
            ..Default::default()
        })
    }
}

struct FakeFactory(Arc<FakePlugin>);

impl PluginFactory for FakeFactory {
    fn build(&self, _config: &InstanceConfig, _paths: &InstancePaths) -> Arc<dyn GamePlugin> {
        self.0.clone()
    }
}

#[derive(Default)]
pub(crate) struct FakeHost {
    pub calls: StdMutex<Vec<String>>,
    pub installer_lines: StdMutex<Vec<String>>,
    pub installer_code: StdMutex<Option<i32>>,
}

impl FakeHost {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn fix_permissions(&self, cfg: &InstanceConfig, _paths: &InstancePaths) -> anyhow::Result<()> {
        self.record(format!("chown {}", cfg.user));
        Ok(())
    }

    async fn resolve_pid(&self, _user: &str, _exe: &str) -> anyhow::Result<Option<u32>> {
        Ok(Some(4242))
    }

    async fn create_user(&self, cfg: &InstanceConfig, password: &str) -> anyhow::Result<()> {
        self.record(format!("create_user {} {password}", cfg.user));
        Ok(())
    }

    async fn remove_user(&self, cfg: &InstanceConfig) -> anyhow::Result<()> {
        self.record(format!("remove_user {}", cfg.user));
        Ok(())
    }

    async fn reset_password(&self, cfg: &InstanceConfig, password: &str) -> anyhow::Result<()> {
        self.record(format!("reset_password {} {password}", cfg.user));
        Ok(())
    }

    async fn spawn_installer(&self, script: &str, args: &[String]) -> Result<ProcessHandle, RuntimeError> {
        self.record(format!("{script} {}", args.join(" ")));
        let lines = self.installer_lines.lock().unwrap().clone();
        let code = *self.installer_code.lock().unwrap();

        let (out_tx, output) = mpsc::channel(lines.len().max(1));
        for l in lines {
            let _ = out_tx.try_send(l);
        }
        drop(out_tx);
        let (exit_tx, exit) = oneshot::channel();
        let _ = exit_tx.send(code);
        Ok(ProcessHandle {
            pid: None,
            input: Box::new(tokio::io::sink()),
            output,
            exit,
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeUsage {
    fail: AtomicBool,
    ticks: AtomicU64,
    last_pid: StdMutex<Option<u32>>,
}

impl FakeUsage {
    pub fn set_fail(&self, v: bool) {
        self.fail.store(v, Ordering::SeqCst);
    }

    pub fn last_pid(&self) -> Option<u32> {
        *self.last_pid.lock().unwrap()
    }
}

#[async_trait]
impl UsageSource for FakeUsage {
    async fn sample(&self, pid: u32) -> anyhow::Result<RawUsage> {
        *self.last_pid.lock().unwrap() = Some(pid);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("process {pid} is gone");
        }
        let cpu_ticks = self.ticks.fetch_add(100, Ordering::SeqCst) + 100;
        Ok(RawUsage {
            cpu_ticks,
            rss_bytes: 4096,
        })
    }

    fn ticks_per_sec(&self) -> u64 {
        100
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Options {
    pub manual_log: bool,
    pub container: bool,
    pub install_url: Option<String>,
}

/// One set of fakes wired into `Services` rooted at a temp dir.
pub(crate) struct Fakes {
    pub rt: Arc<FakeRuntime>,
    pub host: Arc<FakeHost>,
    pub plugin: Arc<FakePlugin>,
    pub usage: Arc<FakeUsage>,
    pub services: Arc<Services>,
}

impl Fakes {
    pub fn new(root: &Path, opts: Options) -> Self {
        let rt = Arc::new(FakeRuntime {
            container: opts.container,
            ..Default::default()
        });
        let host = Arc::new(FakeHost::default());
        let plugin = Arc::new(FakePlugin::new(opts.manual_log));
        let usage = Arc::new(FakeUsage::default());
        let services = Arc::new(Services {
            runtime: rt.clone(),
            host: host.clone(),
            usage: usage.clone(),
            plugins: Arc::new(FakeFactory(plugin.clone())),
            store: ConfigStore::new(root.join("data")),
            settings: Settings {
                basepath: root.join("srv"),
                log_dir: root.join("logs"),
                stop_timeout: Duration::from_secs(30),
                query_failure_kill: false,
                install_url: opts.install_url,
            },
        });
        Self {
            rt,
            host,
            plugin,
            usage,
            services,
        }
    }
}

pub(crate) struct Harness {
    pub inst: Arc<Instance>,
    pub rt: Arc<FakeRuntime>,
    pub host: Arc<FakeHost>,
    pub plugin: Arc<FakePlugin>,
    pub usage: Arc<FakeUsage>,
    pub services: Arc<Services>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(f: impl FnOnce(&mut Options)) -> Self {
        let mut opts = Options::default();
        f(&mut opts);
        let dir = tempfile::tempdir().unwrap();
        let fakes = Fakes::new(dir.path(), opts);
        let inst = Instance::new(sample_config("mc1"), fakes.services.clone());
        Self {
            inst,
            rt: fakes.rt,
            host: fakes.host,
            plugin: fakes.plugin,
            usage: fakes.usage,
            services: fakes.services,
            dir,
        }
    }

    /// Starts the first process and drives it to `On`.
    pub async fn start_on(&self) {
        self.inst.preflight().await.unwrap();
        let idx = self.rt.count(&self.rt.starts) - 1;
        self.rt.emit(idx, "Done!\n").await;
        self.wait_state(PowerState::On).await;
    }

    pub async fn wait_state(&self, want: PowerState) {
        let mut rx = self.inst.events().watch_state();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
            .unwrap();
    }

    pub async fn wait_starts(&self, n: usize) {
        for _ in 0..1000 {
            if self.rt.count(&self.rt.starts) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} starts, saw {}", self.rt.count(&self.rt.starts));
    }

    pub async fn wait_input(&self, idx: usize, want: &str) {
        for _ in 0..1000 {
            if self.rt.input(idx) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected input {want:?}, saw {:?}", self.rt.input(idx));
    }
}

pub(crate) fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(v) = rx.try_recv() {
        out.push(v);
    }
    out
}
