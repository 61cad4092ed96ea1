//! Pool Module
//!
//! Wires the replica repository, the sweeper, the flush queues, the storage
//! handler and the flush controller into one pool, and exposes the operations
//! an operator or a door would call on it.
//!
//! A pool owns its base directory exclusively: `data/` holds replica files,
//! `meta/` their records, and `pool.lock` keeps a second process out.

use crate::account::{Account, SpaceRecord};
use crate::config::Config;
use crate::flush_controller::{FlushControllerStatus, FlushSettings, HsmFlushController};
use crate::hsm_set::HsmSet;
use crate::metadata_store::FileMetaDataStore;
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::namespace::NameSpace;
use crate::replica_types::{PnfsId, ReplicaState};
use crate::repository::{InventoryReport, ReplicaRepository};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::storage_class::{StorageClassKey, StorageClassStatus};
use crate::storage_class_container::StorageClassContainer;
use crate::storage_handler::{HsmStorageHandler, StorageHandlerSettings, Submission};
use crate::sweeper::{build_sweeper, Sweeper, SweeperKind};
use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sweeper part of [`PoolInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperInfo {
    pub kind: SweeperKind,
    pub indexed: usize,
    pub removable_space: u64,
    pub pending_reclaim: u64,
}

/// Job queue part of [`PoolInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueueInfo {
    pub max_active: usize,
    pub active: usize,
    pub queued: usize,
}

/// Everything an operator sees about a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub name: String,
    pub base_dir: PathBuf,
    pub replicas: usize,
    pub space: SpaceRecord,
    pub sweeper: SweeperInfo,
    pub fetch_queue: JobQueueInfo,
    pub store_queue: JobQueueInfo,
    pub storage_classes: Vec<StorageClassStatus>,
    pub flush: FlushControllerStatus,
    pub metrics: MetricsSnapshot,
}

pub struct Pool {
    name: String,
    base_dir: PathBuf,
    gap: u64,
    audit_interval: Duration,
    shutdown_timeout: Duration,
    repository: Arc<ReplicaRepository>,
    sweeper_kind: SweeperKind,
    sweeper: Arc<dyn Sweeper>,
    container: Arc<StorageClassContainer>,
    storage_handler: Arc<HsmStorageHandler>,
    flush_controller: Arc<HsmFlushController>,
    namespace: Arc<dyn NameSpace>,
    metrics: Arc<PoolMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _lock_file: File,
}

impl Pool {
    /// Builds a pool from its configuration. Nothing is loaded from disk until
    /// [`Pool::start`].
    pub fn new(config: &Config, namespace: Arc<dyn NameSpace>) -> Result<Arc<Self>> {
        let pool_config = &config.pool;
        std::fs::create_dir_all(&pool_config.base_dir).map_err(|e| {
            PoolError::IoError(format!(
                "Failed to create pool directory {:?}: {}",
                pool_config.base_dir, e
            ))
        })?;
        let lock_file = lock_base_dir(&pool_config.base_dir)?;

        let metrics = Arc::new(PoolMetrics::new());
        let account = Arc::new(Account::new(pool_config.total_space));
        let metadata = FileMetaDataStore::new(pool_config.meta_dir())?;
        let repository = Arc::new(ReplicaRepository::new(
            pool_config.data_dir(),
            Box::new(metadata),
            account,
        )?);
        repository.set_volatile(pool_config.volatile);
        repository.set_sticky_allowed(pool_config.sticky_allowed);
        repository.set_allocation_blocking(pool_config.allocation_blocking);

        let sweeper = build_sweeper(
            config.sweeper.kind,
            &repository,
            config.sweeper.pass_delay,
            Arc::clone(&metrics),
        );

        let container = Arc::new(StorageClassContainer::new(
            config.storage_classes.defaults.to_settings(),
        ));
        for class in &config.storage_classes.classes {
            container.define(class.key()?, class.to_settings());
        }
        repository.add_listener(container.clone());

        let storage_handler = Arc::new(HsmStorageHandler::new(
            Arc::clone(&repository),
            Arc::new(HsmSet::new(config.hsms.clone())),
            Arc::clone(&namespace),
            StorageHandlerSettings::from(&config.storage_handler),
            Arc::clone(&metrics),
        ));
        let flush_controller = Arc::new(HsmFlushController::new(
            Arc::clone(&container),
            Arc::clone(&storage_handler),
            FlushSettings::from(&config.flush),
            Arc::clone(&metrics),
        ));

        info!(
            "Pool {} created: {} bytes in {:?}, sweeper {:?}, {} HSM instances",
            pool_config.name,
            pool_config.total_space,
            pool_config.base_dir,
            config.sweeper.kind,
            config.hsms.len()
        );

        Ok(Arc::new(Self {
            name: pool_config.name.clone(),
            base_dir: pool_config.base_dir.clone(),
            gap: pool_config.gap(),
            audit_interval: pool_config.audit_interval,
            shutdown_timeout: pool_config.shutdown_timeout,
            repository,
            sweeper_kind: config.sweeper.kind,
            sweeper,
            container,
            storage_handler,
            flush_controller,
            namespace,
            metrics,
            tasks: Mutex::new(Vec::new()),
            _lock_file: lock_file,
        }))
    }

    /// Runs the inventory and starts the background loops.
    pub async fn start(self: &Arc<Self>, shutdown: &ShutdownCoordinator) -> Result<InventoryReport> {
        let report = self.repository.load(self.namespace.as_ref()).await?;
        info!(
            "Pool {} inventory: {} loaded, {} removed, {} skipped",
            self.name, report.loaded, report.removed, report.skipped
        );
        if let Some(problem) = self.repository.check_consistency() {
            self.metrics.record_audit_warning();
            warn!("Pool {} starts with inconsistent accounting: {}", self.name, problem);
        }

        let mut tasks = self.tasks.lock().unwrap();
        if let Some(handle) = Arc::clone(&self.sweeper).start(shutdown.signal()) {
            tasks.push(handle);
        }
        tasks.push(Arc::clone(&self.flush_controller).start(shutdown.signal()));
        tasks.push(self.start_maintenance(shutdown.signal()));
        drop(tasks);

        info!("Pool {} started", self.name);
        Ok(report)
    }

    /// Expires sticky records and audits the space accounting every `audit_interval`.
    fn start_maintenance(&self, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let repository = Arc::clone(&self.repository);
        let metrics = Arc::clone(&self.metrics);
        let interval = self.audit_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                repository.remove_expired_sticky(SystemTime::now());
                if repository.check_consistency().is_some() {
                    metrics.record_audit_warning();
                }
            }
            debug!("Maintenance loop stopped");
        })
    }

    /// Drains the job queues and stops the background loops.
    pub async fn shutdown(&self) {
        if !self.storage_handler.shutdown(self.shutdown_timeout).await {
            warn!(
                "HSM jobs of pool {} still running after {:?}",
                self.name, self.shutdown_timeout
            );
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in tasks {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Background task of pool {} failed: {}", self.name, e);
                }
            }
        }

        self.repository.clear_listeners();
        info!("Pool {} stopped", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn repository(&self) -> &Arc<ReplicaRepository> {
        &self.repository
    }

    pub fn sweeper(&self) -> &Arc<dyn Sweeper> {
        &self.sweeper
    }

    pub fn storage_classes(&self) -> &Arc<StorageClassContainer> {
        &self.container
    }

    pub fn storage_handler(&self) -> &Arc<HsmStorageHandler> {
        &self.storage_handler
    }

    pub fn flush_controller(&self) -> &Arc<HsmFlushController> {
        &self.flush_controller
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub fn space_record(&self) -> SpaceRecord {
        let (total, free, precious, removable) = self.repository.account().snapshot();
        SpaceRecord {
            total,
            free,
            precious,
            removable,
            lru_seconds: self.sweeper.lru_seconds(),
            gap: self.gap,
        }
    }

    /// Changes the pool size. Shrinking below the used space fails.
    pub fn set_total_space(&self, total: u64) -> Result<()> {
        self.repository.account().set_total(total)?;
        info!("Pool {} resized to {} bytes", self.name, total);
        Ok(())
    }

    /// Restores a file from its HSM, looking up its attributes in the name space.
    pub async fn fetch(&self, id: &PnfsId) -> Result<Submission> {
        let attributes = self.namespace.get_storage_info(id).await?;
        self.storage_handler.fetch(attributes)
    }

    /// Flushes one precious replica outside of its storage class batch.
    pub async fn flush_replica(&self, id: &PnfsId) -> Result<()> {
        self.storage_handler.store(id).await?.wait().await?;
        // A replica kept precious after the store would otherwise stay queued
        self.container.remove_entry(id);
        Ok(())
    }

    /// Submits up to `max_count` requests of the `class@hsm` queue.
    pub async fn flush_storage_class(&self, name: &str, max_count: usize) -> Result<usize> {
        let key = StorageClassKey::parse(name)?;
        self.flush_controller.flush_storage_class(&key, max_count).await
    }

    /// Sets a sticky record for `owner`; `None` never expires and a zero
    /// lifetime clears the owner's record.
    pub fn set_sticky(&self, id: &PnfsId, owner: &str, lifetime: Option<Duration>) -> Result<()> {
        let expires_at = lifetime.map(|lifetime| SystemTime::now() + lifetime);
        self.repository.set_sticky(id, owner, expires_at, true)
    }

    pub fn set_sticky_allowed(&self, allowed: bool) {
        self.repository.set_sticky_allowed(allowed);
        info!("Sticky flags {} on pool {}", if allowed { "enabled" } else { "disabled" }, self.name);
    }

    /// Administrative state change. `Cached -> Precious` is allowed here.
    pub fn set_replica_state(&self, id: &PnfsId, state: ReplicaState) -> Result<()> {
        self.repository.set_state(id, state, true)
    }

    /// Removes a replica. Precious replicas need `force` since their only copy
    /// is on this pool.
    pub fn remove_replica(&self, id: &PnfsId, force: bool) -> Result<u64> {
        match self.repository.state(id) {
            None => Err(PoolError::FileNotInCache(id.to_string())),
            Some(ReplicaState::Precious) if !force => Err(PoolError::InvalidRequest(format!(
                "{} is precious and not yet on tape",
                id
            ))),
            Some(_) => self.repository.remove(id),
        }
    }

    pub fn info(&self) -> PoolInfo {
        let handler_settings = self.storage_handler.settings();
        PoolInfo {
            name: self.name.clone(),
            base_dir: self.base_dir.clone(),
            replicas: self.repository.len(),
            space: self.space_record(),
            sweeper: SweeperInfo {
                kind: self.sweeper_kind,
                indexed: self.sweeper.len(),
                removable_space: self.sweeper.removable_space(),
                pending_reclaim: self.sweeper.pending_reclaim(),
            },
            fetch_queue: JobQueueInfo {
                max_active: handler_settings.max_active_fetch,
                active: self.storage_handler.fetch_active_count(),
                queued: self.storage_handler.fetch_queue_size(),
            },
            store_queue: JobQueueInfo {
                max_active: handler_settings.max_active_store,
                active: self.storage_handler.store_active_count(),
                queued: self.storage_handler.store_queue_size(),
            },
            storage_classes: self.container.status(),
            flush: self.flush_controller.status(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// Takes the exclusive lock on the pool directory.
fn lock_base_dir(base_dir: &Path) -> Result<File> {
    use fs2::FileExt;

    let path = base_dir.join("pool.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .map_err(|e| PoolError::IoError(format!("Failed to open lock file {:?}: {}", path, e)))?;
    file.try_lock_exclusive().map_err(|e| {
        PoolError::ConfigError(format!(
            "Pool directory {:?} is in use by another process: {}",
            base_dir, e
        ))
    })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::MemoryNameSpace;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.pool.name = "test-pool".to_string();
        config.pool.base_dir = dir.path().join("pool");
        config.pool.total_space = 1024 * 1024;
        config
    }

    #[tokio::test]
    async fn test_pool_starts_empty() {
        let dir = TempDir::new().unwrap();
        let pool = Pool::new(&config(&dir), Arc::new(MemoryNameSpace::new())).unwrap();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

        let report = pool.start(&coordinator).await.unwrap();
        assert_eq!(report, InventoryReport::default());

        let info = pool.info();
        assert_eq!(info.name, "test-pool");
        assert_eq!(info.replicas, 0);
        assert_eq!(info.space.total, 1024 * 1024);
        assert_eq!(info.space.free, 1024 * 1024);
        assert_eq!(info.space.gap, 256 * 1024);
        assert_eq!(info.sweeper.kind, SweeperKind::Lru);
        assert_eq!(info.fetch_queue.max_active, 10);
        assert!(dir.path().join("pool/data").is_dir());
        assert!(dir.path().join("pool/meta").is_dir());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_base_dir_is_locked() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let _pool = Pool::new(&config, Arc::new(MemoryNameSpace::new())).unwrap();
        let second = Pool::new(&config, Arc::new(MemoryNameSpace::new()));
        assert!(matches!(second, Err(PoolError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_missing_replica_operations_fail() {
        let dir = TempDir::new().unwrap();
        let pool = Pool::new(&config(&dir), Arc::new(MemoryNameSpace::new())).unwrap();
        let id = PnfsId::new("00AB").unwrap();

        assert!(pool.remove_replica(&id, true).unwrap_err().is_not_found());
        assert!(pool.fetch(&id).await.unwrap_err().is_not_found());
        assert!(pool.flush_storage_class("raw", 10).await.is_err());
        assert!(pool.set_total_space(2048).is_ok());
        assert_eq!(pool.space_record().total, 2048);
    }

    #[tokio::test]
    async fn test_operator_operations_on_replica() {
        use crate::replica_types::{FileAttributes, StorageInfo};

        let dir = TempDir::new().unwrap();
        let pool = Pool::new(&config(&dir), Arc::new(MemoryNameSpace::new())).unwrap();
        let id = PnfsId::new("00AC").unwrap();
        let handle = pool
            .repository()
            .create_entry(
                FileAttributes::new(id.clone(), 5, StorageInfo::new("osm", "raw")),
                ReplicaState::ReceivingFromClient,
                ReplicaState::Precious,
                Vec::new(),
            )
            .unwrap();
        std::fs::write(handle.file(), b"hello").unwrap();
        handle.commit().unwrap();
        assert_eq!(pool.storage_classes().request_count(), 1);

        // Precious data has no other copy
        assert!(matches!(
            pool.remove_replica(&id, false),
            Err(PoolError::InvalidRequest(_))
        ));

        pool.set_sticky(&id, "operator", None).unwrap();
        assert!(pool.repository().get_entry(&id).unwrap().is_sticky());
        pool.set_sticky(&id, "operator", Some(Duration::ZERO)).unwrap();
        assert!(!pool.repository().get_entry(&id).unwrap().is_sticky());

        pool.set_sticky_allowed(false);
        assert!(pool.set_sticky(&id, "operator", None).is_err());

        pool.set_replica_state(&id, ReplicaState::Cached).unwrap();
        assert_eq!(pool.storage_classes().request_count(), 0);
        assert_eq!(pool.space_record().removable, 5);
        assert!(pool.set_total_space(4).is_err());

        assert_eq!(pool.remove_replica(&id, false).unwrap(), 5);
        assert_eq!(pool.info().replicas, 0);
        assert_eq!(pool.space_record().free, 1024 * 1024);
    }
}
