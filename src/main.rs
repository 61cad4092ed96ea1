use hsm_pool::{
    config::Config,
    logging::LoggerManager,
    namespace::JsonNameSpace,
    pool::Pool,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LOG_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let logger = LoggerManager::from_config(&config.logging, hostname);
    logger.initialize()?;

    info!(
        "Starting HSM pool v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "Pool {}: base_dir={}, total_space={}MB, sweeper={:?}",
        config.pool.name,
        config.pool.base_dir.display(),
        config.pool.total_space / 1024 / 1024,
        config.sweeper.kind
    );
    for hsm in &config.hsms {
        info!("HSM instance {} (type {}): {}", hsm.instance, hsm.hsm_type, hsm.command);
    }
    info!(
        "Flush: interval={:?}, max_active={}, max_batch_size={}",
        config.flush.interval, config.flush.max_active, config.flush.max_batch_size
    );

    let namespace = Arc::new(JsonNameSpace::new(&config.namespace.dir)?);
    let pool = Pool::new(&config, namespace)?;

    let mut shutdown_coordinator = ShutdownCoordinator::new(config.pool.shutdown_timeout);
    let report = pool.start(&shutdown_coordinator).await?;
    info!(
        "Pool {} online with {} replicas ({} dropped by the inventory)",
        pool.name(),
        report.loaded,
        report.removed
    );

    // Periodic log cleanup
    let mut cleanup_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());
    let _log_cleanup_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(LOG_CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match logger.cleanup_old_logs() {
                        Ok(0) => debug!("No old log files to remove"),
                        Ok(removed) => info!("Removed {} old log files", removed),
                        Err(e) => warn!("Log cleanup failed: {}", e),
                    }
                }
                _ = cleanup_shutdown.wait_for_shutdown() => break,
            }
        }
    });

    shutdown_coordinator.set_pool(Arc::clone(&pool));

    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    info!("HSM pool shutdown complete");
    Ok(())
}
