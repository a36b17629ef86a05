use std::sync::OnceLock;

use async_trait::async_trait;
use hearth_process::ResourceUsage;
use tokio::time::Instant;

/// Cumulative counters for one process at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawUsage {
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
}

#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Errors when the process is gone or unreadable.
    async fn sample(&self, pid: u32) -> anyhow::Result<RawUsage>;

    fn ticks_per_sec(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcUsageSource;

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

/// utime + stime from `/proc/<pid>/stat`; the comm field may contain spaces.
fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

fn parse_statm_resident_pages(statm: &str) -> Option<u64> {
    let mut it = statm.split_whitespace();
    let _size_pages = it.next()?;
    it.next()?.parse().ok()
}

#[cfg(target_os = "linux")]
#[async_trait]
impl UsageSource for ProcUsageSource {
    async fn sample(&self, pid: u32) -> anyhow::Result<RawUsage> {
        use anyhow::Context;

        let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
            .await
            .with_context(|| format!("process {pid} is gone"))?;
        let cpu_ticks = parse_stat_ticks(&stat).with_context(|| format!("malformed stat for {pid}"))?;
        let statm = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
            .await
            .with_context(|| format!("process {pid} is gone"))?;
        let pages = parse_statm_resident_pages(&statm).with_context(|| format!("malformed statm for {pid}"))?;
        Ok(RawUsage {
            cpu_ticks,
            rss_bytes: pages.saturating_mul(page_size()),
        })
    }

    fn ticks_per_sec(&self) -> u64 {
        ticks_per_sec()
    }
}

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl UsageSource for ProcUsageSource {
    async fn sample(&self, pid: u32) -> anyhow::Result<RawUsage> {
        anyhow::bail!("resource sampling is unsupported on this platform (pid {pid})")
    }

    fn ticks_per_sec(&self) -> u64 {
        ticks_per_sec()
    }
}

/// Whole-percent CPU from the tick delta over wall time.
pub fn cpu_percent(prev_ticks: u64, prev_at: Instant, ticks: u64, now: Instant, ticks_per_sec: u64) -> u32 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 || ticks_per_sec == 0 {
        return 0;
    }
    let delta = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = ((delta / ticks_per_sec as f64) / dt * 100.0).round();
    if cpu.is_finite() {
        cpu.clamp(0.0, u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Keeps the previous reading so each sample reports the delta since the last.
#[derive(Debug, Default)]
pub struct UsageTracker {
    last: Option<(u64, Instant)>,
}

impl UsageTracker {
    pub fn observe(&mut self, raw: RawUsage, now: Instant, ticks_per_sec: u64) -> ResourceUsage {
        let cpu = self
            .last
            .map(|(prev_ticks, prev_at)| cpu_percent(prev_ticks, prev_at, raw.cpu_ticks, now, ticks_per_sec))
            .unwrap_or(0);
        self.last = Some((raw.cpu_ticks, now));
        ResourceUsage {
            cpu_percent: cpu,
            memory_bytes: raw.rss_bytes,
        }
    }
}
