//! Graceful Shutdown Module
//!
//! Handles graceful shutdown of the pool: signal handling, stopping the
//! background loops (sweeper, flush controller, maintenance), and draining the
//! HSM job queues so that every waiting caller receives a result.

use crate::pool::Pool;
use crate::{PoolError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful pool shutdown
pub struct ShutdownCoordinator {
    pool: Option<Arc<Pool>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            pool: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    pub fn set_pool(&mut self, pool: Arc<Pool>) {
        self.pool = Some(pool);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.subscribe())
    }

    /// Waits for SIGINT or SIGTERM, then shuts down.
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                PoolError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                PoolError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Error during graceful shutdown: {}", e);
                Err(e)
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                self.force_shutdown();
                Err(PoolError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    async fn perform_shutdown(&self) -> Result<()> {
        info!("Performing shutdown operations");

        if let Some(pool) = &self.pool {
            info!("Stopping pool {}", pool.name());
            pool.shutdown().await;
        }

        // Give a moment for final log messages to be written
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("Shutdown operations completed");
        Ok(())
    }

    /// Cancels all HSM jobs without waiting for them.
    pub fn force_shutdown(&self) {
        warn!("Performing force shutdown");
        if let Some(pool) = &self.pool {
            pool.storage_handler().cancel_all();
        }
        warn!("Force shutdown completed");
    }
}

/// Shutdown signal wrapper for background loops
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal. Cancel safe.
    pub async fn wait_for_shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        // A closed or lagged channel also means the coordinator is gone or fired
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }

    /// Try to receive shutdown signal without blocking
    pub fn try_recv_shutdown(&mut self) -> bool {
        match self.receiver.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => self.shutdown_requested,
            _ => {
                self.shutdown_requested = true;
                true
            }
        }
    }
}
