use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::info;

use darshan::config::PlatformConfig;
use darshan::engine::Platform;
use darshan::notify::NotifyHub;
use darshan::store::MemStore;
use darshan::tasks;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = PlatformConfig::from_env();
    darshan::observability::init(config.metrics_port)?;

    let store = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Arc::new(MemStore::open(&dir.join("darshan.wal"))?)
        }
        None => Arc::new(MemStore::new()),
    };
    let hub = Arc::new(NotifyHub::new());
    let platform = Platform::new(store.clone(), hub, &config);

    info!("darshan started");
    info!(
        "  store: {}",
        config
            .data_dir
            .as_ref()
            .map_or("volatile".to_string(), |d| d.display().to_string())
    );
    info!("  zone tick: {:?}", config.tick_interval);
    info!("  sweep interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let mut workers = JoinSet::new();
    workers.spawn(tasks::run_zone_ticker(platform.zones.clone(), config.tick_interval));
    workers.spawn(tasks::run_sos_escalator(platform.dispatch.clone(), config.sweep_interval));
    workers.spawn(tasks::run_booking_expirer(platform.ledger.clone(), config.sweep_interval));
    if store.is_durable() {
        workers.spawn(tasks::run_compactor(
            store.clone(),
            config.compact_threshold,
            config.sweep_interval,
        ));
    }

    // Graceful shutdown: on SIGTERM/ctrl-c stop the sweepers, then flush the log
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown signal received, stopping background tasks");

    workers.abort_all();
    let drain = async { while workers.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("background tasks did not stop within 10s");
    }

    if store.is_durable() {
        store.compact().await?;
    }
    if let Ok(stats) = platform.zones.get().await {
        info!(
            "final zone counts: gate={} queue={} inner={} exit={}",
            stats.gate, stats.queue, stats.inner, stats.exit
        );
    }
    info!("darshan stopped");
    Ok(())
}
