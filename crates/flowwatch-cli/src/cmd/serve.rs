use anyhow::{Context, Result};
use flowwatch_core::config::{MonitorConfig, WarnLevel};
use flowwatch_core::store::RedbChangeStore;
use flowwatch_core::Monitor;
use std::path::Path;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

pub fn run(root: &Path, port: u16) -> Result<()> {
    let config = MonitorConfig::load(root).context("failed to load config")?;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            WarnLevel::Error => tracing::error!("config: {}", w.message),
        }
    }

    let store_path = config.store_path(root);
    let store = RedbChangeStore::open(&store_path)
        .with_context(|| format!("failed to open change store {}", store_path.display()))?;
    tracing::info!(path = %store_path.display(), "opened change store");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config, store, port))
}

async fn serve(config: MonitorConfig, store: RedbChangeStore, port: u16) -> Result<()> {
    let monitor = Monitor::new(config, Arc::new(store)).context("failed to start monitor")?;

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    let actual_port = listener.local_addr()?.port();
    println!("flowwatch → http://localhost:{actual_port}  (PID {})", std::process::id());

    let served = flowwatch_server::serve_on(Arc::clone(&monitor), listener, shutdown_signal()).await;

    tracing::info!(pending = monitor.health().pending, "flushing remaining changes");
    let flushed = monitor
        .shutdown()
        .await
        .context("final flush failed; unpersisted changes were lost");
    served.and(flushed)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler: run until the process is killed.
        std::future::pending::<()>().await;
    }
    tracing::info!("received Ctrl+C, shutting down");
}
