use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error_payload;
mod events;
mod files;
mod host;
mod http_api;
mod model;
mod output;
mod plugin;
mod registry;
mod runtime;
mod sampler;
mod store;
mod supervisor;

use config::DaemonConfig;
use registry::InstanceRegistry;
use runtime::{DockerRuntime, NativeRuntime, RuntimeController};
use supervisor::{Services, Settings};

/// Stdout plus a daily-rolling `hearth.log` in the log directory. The
/// returned guard flushes the file writer when dropped.
fn init_tracing(cfg: &DaemonConfig) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&cfg.log_dir)
        .with_context(|| format!("create log dir {}", cfg.log_dir.display()))?;
    let (file, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&cfg.log_dir, "hearth.log"));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
        .init();
    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = DaemonConfig::load()?;
    let _log_guard = init_tracing(&cfg)?;

    let runtime: Arc<dyn RuntimeController> = if cfg.docker {
        Arc::new(DockerRuntime::new(cfg.docker_image_prefix.clone()))
    } else {
        Arc::new(NativeRuntime)
    };
    tracing::info!(
        docker = cfg.docker,
        basepath = %cfg.basepath.display(),
        data_dir = %cfg.data_dir.display(),
        "starting hearth daemon"
    );

    let services = Arc::new(Services {
        runtime,
        host: Arc::new(host::SystemHost::new(
            cfg.basepath.clone(),
            cfg.scripts_dir.clone(),
            cfg.service_group.clone(),
        )),
        usage: Arc::new(sampler::ProcUsageSource),
        plugins: Arc::new(plugin::BuiltinPlugins),
        store: store::ConfigStore::new(cfg.data_dir.clone()),
        settings: Settings::from_config(&cfg),
    });
    let registry = InstanceRegistry::boot(services).await?;
    tracing::info!(servers = ?registry.names().await, "servers registered");

    let state = http_api::AppState {
        registry: registry.clone(),
        keys: Arc::from(cfg.keys.clone()),
    };
    let addr = cfg.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "hearth HTTP listening");

    axum::serve(listener, http_api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, killing all servers");
    registry.kill_all().await;
    Ok(())
}
