use std::time::Duration;

use anyhow::Context;
use hearth_process::QuerySnapshot;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// TCP reachability probe of the game endpoint.
pub async fn probe_reachability(host: &str, port: u16) -> anyhow::Result<QuerySnapshot> {
    // The game listens on all interfaces; probe loopback when bound to the wildcard.
    let target = if host == "0.0.0.0" { "127.0.0.1" } else { host };
    let started = tokio::time::Instant::now();
    let stream = tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect((target, port)))
        .await
        .with_context(|| format!("query {target}:{port} timed out"))?
        .with_context(|| format!("query {target}:{port} failed"))?;
    drop(stream);

    Ok(QuerySnapshot {
        online: true,
        latency_ms: Some(started.elapsed().as_millis() as u64),
        time: unix_ms(),
        ..QuerySnapshot::default()
    })
}
