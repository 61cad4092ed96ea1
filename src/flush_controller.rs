//! Flush Controller Module
//!
//! Periodically submits triggered flush queues to the storage handler, with a
//! bound on the number of storage classes flushing at the same time. An
//! external coordinator can suspend all flushing until a deadline.

use crate::metrics::PoolMetrics;
use crate::shutdown::ShutdownSignal;
use crate::storage_class::{FlushCallback, StorageClassInfo, StorageClassKey};
use crate::storage_class_container::StorageClassContainer;
use crate::storage_handler::HsmStorageHandler;
use crate::{PoolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushSettings {
    pub interval: Duration,
    /// Maximum number of storage classes flushing at the same time.
    pub max_active: usize,
    /// Minimum time between two submissions of the same queue.
    pub retry_delay_on_error: Duration,
    /// Maximum number of replicas per batch.
    pub max_batch_size: usize,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_active: 1000,
            retry_delay_on_error: Duration::from_secs(60),
            max_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushControllerStatus {
    pub interval_secs: u64,
    pub max_active: usize,
    pub retry_delay_secs: u64,
    pub max_batch_size: usize,
    pub hold_until: Option<DateTime<Utc>>,
    pub active_classes: usize,
}

pub struct HsmFlushController {
    container: Arc<StorageClassContainer>,
    handler: Arc<HsmStorageHandler>,
    settings: RwLock<FlushSettings>,
    hold_until: Mutex<Option<SystemTime>>,
    wake: Notify,
    metrics: Arc<PoolMetrics>,
}

impl HsmFlushController {
    pub fn new(
        container: Arc<StorageClassContainer>,
        handler: Arc<HsmStorageHandler>,
        settings: FlushSettings,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            container,
            handler,
            settings: RwLock::new(settings),
            hold_until: Mutex::new(None),
            wake: Notify::new(),
            metrics,
        }
    }

    pub fn settings(&self) -> FlushSettings {
        self.settings.read().unwrap().clone()
    }

    pub fn start(self: Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Flush controller started (interval {:?})", self.settings().interval);
            loop {
                self.run_cycle().await;
                let interval = self.settings().interval;
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.wake.notified() => debug!("Flush controller woken up"),
                }
            }
            info!("Flush controller stopped");
        })
    }

    /// Submits every triggered, idle queue until `max_active` classes are
    /// flushing. Returns the number of queues submitted.
    pub async fn run_cycle(&self) -> usize {
        if self.is_holding() {
            debug!("Flushing is on hold");
            return 0;
        }

        let settings = self.settings();
        let classes = self.container.classes();
        let mut active = classes.iter().filter(|info| info.is_active()).count();
        let now = SystemTime::now();
        let mut submitted = 0;

        for info in classes {
            if active >= settings.max_active {
                break;
            }
            if info.is_active() || !info.is_triggered_at(now) {
                continue;
            }
            if let Some(last) = info.last_submitted() {
                if now.duration_since(last).unwrap_or_default() < settings.retry_delay_on_error {
                    continue;
                }
            }
            match info.submit(&self.handler, settings.max_batch_size, Some(self.on_batch_done())).await {
                Ok(_) => {
                    active += 1;
                    submitted += 1;
                }
                Err(e) => warn!("Failed to flush {}: {}", info.key(), e),
            }
        }
        submitted
    }

    /// Flushes one storage class regardless of its thresholds.
    pub async fn flush_storage_class(&self, key: &StorageClassKey, max_count: usize) -> Result<usize> {
        let info: Arc<StorageClassInfo> = self
            .container
            .get(key)
            .ok_or_else(|| PoolError::InvalidRequest(format!("No such storage class: {}", key)))?;
        info!("Flushing storage class {} on request", key);
        info.submit(&self.handler, max_count, Some(self.on_batch_done()))
            .await
    }

    fn on_batch_done(&self) -> FlushCallback {
        let metrics = Arc::clone(&self.metrics);
        Box::new(move |outcome| {
            debug!(
                "Batch of {} done: {} requests, {} failures",
                outcome.key, outcome.requests, outcome.failures
            );
            metrics.record_flush_batch(outcome.failures);
        })
    }

    /// Suspends flushing until `until`.
    pub fn set_hold_until(&self, until: SystemTime) {
        *self.hold_until.lock().unwrap() = Some(until);
        info!("Flushing on hold until {}", DateTime::<Utc>::from(until).to_rfc3339());
    }

    pub fn hold_for(&self, duration: Duration) {
        self.set_hold_until(SystemTime::now() + duration);
    }

    pub fn release_hold(&self) {
        *self.hold_until.lock().unwrap() = None;
        self.wake();
    }

    pub fn is_holding(&self) -> bool {
        match *self.hold_until.lock().unwrap() {
            Some(until) => until > SystemTime::now(),
            None => false,
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        self.settings.write().unwrap().interval = interval;
        self.wake();
    }

    pub fn set_max_active(&self, max_active: usize) {
        self.settings.write().unwrap().max_active = max_active;
    }

    pub fn set_retry_delay_on_error(&self, delay: Duration) {
        self.settings.write().unwrap().retry_delay_on_error = delay;
    }

    pub fn set_max_batch_size(&self, max_batch_size: usize) {
        self.settings.write().unwrap().max_batch_size = max_batch_size;
    }

    /// Starts the next cycle right away.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn status(&self) -> FlushControllerStatus {
        let settings = self.settings();
        let hold_until = *self.hold_until.lock().unwrap();
        FlushControllerStatus {
            interval_secs: settings.interval.as_secs(),
            max_active: settings.max_active,
            retry_delay_secs: settings.retry_delay_on_error.as_secs(),
            max_batch_size: settings.max_batch_size,
            hold_until: hold_until
                .filter(|until| *until > SystemTime::now())
                .map(DateTime::<Utc>::from),
            active_classes: self
                .container
                .classes()
                .iter()
                .filter(|info| info.is_active())
                .count(),
        }
    }
}
