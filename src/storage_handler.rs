//! Storage Handler Module
//!
//! Moves replicas between the pool and its HSMs.
//!
//! - **fetch** restores a file from tape into a new `Cached` replica
//! - **store** writes a `Precious` replica to tape, records the new location in
//!   the name space and turns the replica `Cached`
//!
//! Per file and direction at most one job exists. Callers arriving while a job
//! is registered join it and observe the same outcome. Jobs run on two
//! independent [`JobScheduler`]s with their own worker limits.

use crate::hsm_command::HsmCommand;
use crate::hsm_set::{Direction, HsmLocation, HsmSet};
use crate::inflight_tracker::{CompletionGuard, InFlightTracker, JobRole, JobWaiter};
use crate::job_queue::{Job, JobInfo, JobScheduler, JobStatus};
use crate::metrics::PoolMetrics;
use crate::namespace::NameSpace;
use crate::replica_types::{
    AccessLatency, FileAttributes, PnfsId, ReplicaState, RetentionPolicy,
};
use crate::repository::{ReplicaHandle, ReplicaRepository};
use crate::{PoolError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extension of the checksum file an HSM script may leave next to a restored file.
const CHECKSUM_FILE_EXTENSION: &str = "crcval";

/// Checksum type of values found in checksum files (ADLER32).
const CHECKSUM_FILE_TYPE: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandlerSettings {
    pub max_active_fetch: usize,
    pub max_active_store: usize,
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
    pub notify_retry_delay: Duration,
    pub check_namespace_before_store: bool,
    pub retain_online_custodial: bool,
    pub max_output_lines: usize,
}

impl Default for StorageHandlerSettings {
    fn default() -> Self {
        Self {
            max_active_fetch: 10,
            max_active_store: 10,
            fetch_timeout: Duration::from_secs(4 * 3600),
            store_timeout: Duration::from_secs(4 * 3600),
            notify_retry_delay: Duration::from_secs(120),
            check_namespace_before_store: true,
            retain_online_custodial: false,
            max_output_lines: 200,
        }
    }
}

/// How a fetch or store request was handled.
#[derive(Debug)]
pub enum Submission {
    /// Nothing to do: the replica is already on disk (fetch) or on tape (store).
    AlreadyDone,
    /// A new job was registered.
    Scheduled(JobWaiter),
    /// A job for the file was already registered and the caller joined it.
    Joined(JobWaiter),
}

impl Submission {
    /// Waits for the outcome of the request.
    pub async fn wait(self) -> Result<()> {
        match self {
            Submission::AlreadyDone => Ok(()),
            Submission::Scheduled(waiter) | Submission::Joined(waiter) => waiter.wait().await,
        }
    }
}

/// Admin view of an HSM job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmJobInfo {
    pub id: u64,
    pub pnfs_id: String,
    pub status: JobStatus,
    /// Replica state, or `<zombie>` if the replica is gone.
    pub replica: String,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct HsmStorageHandler {
    repository: Arc<ReplicaRepository>,
    hsm_set: Arc<HsmSet>,
    namespace: Arc<dyn NameSpace>,
    fetch_queue: Arc<JobScheduler>,
    store_queue: Arc<JobScheduler>,
    fetch_tracker: InFlightTracker,
    store_tracker: InFlightTracker,
    settings: RwLock<StorageHandlerSettings>,
    metrics: Arc<PoolMetrics>,
}

impl HsmStorageHandler {
    pub fn new(
        repository: Arc<ReplicaRepository>,
        hsm_set: Arc<HsmSet>,
        namespace: Arc<dyn NameSpace>,
        settings: StorageHandlerSettings,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            repository,
            hsm_set,
            namespace,
            fetch_queue: JobScheduler::new("fetch", settings.max_active_fetch),
            store_queue: JobScheduler::new("store", settings.max_active_store),
            fetch_tracker: InFlightTracker::new(),
            store_tracker: InFlightTracker::new(),
            settings: RwLock::new(settings),
            metrics,
        }
    }

    pub fn settings(&self) -> StorageHandlerSettings {
        self.settings.read().unwrap().clone()
    }

    pub fn hsm_set(&self) -> &Arc<HsmSet> {
        &self.hsm_set
    }

    /// Restores a file from its HSM into a new `Cached` replica.
    pub fn fetch(self: &Arc<Self>, attributes: FileAttributes) -> Result<Submission> {
        let id = attributes.id.clone();
        let (guard, waiter) = match self.fetch_tracker.try_register(&id) {
            JobRole::Waiter(waiter) => {
                debug!("Joining fetch of {}", id);
                return Ok(Submission::Joined(waiter));
            }
            JobRole::Owner(guard, waiter) => (guard, waiter),
        };

        match self.repository.state(&id) {
            Some(ReplicaState::Precious) | Some(ReplicaState::Cached) => {
                guard.complete(Ok(()));
                return Ok(Submission::AlreadyDone);
            }
            Some(state) => {
                let err = PoolError::FileInCache(format!("{} is being written ({})", id, state));
                guard.complete(Err(err.clone()));
                return Err(err);
            }
            None => {}
        }

        let handle = match self.repository.create_entry(
            attributes,
            ReplicaState::ReceivingFromStore,
            ReplicaState::Cached,
            Vec::new(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                guard.complete(Err(e.clone()));
                return Err(e);
            }
        };

        let job = Arc::new(FetchJob {
            handler: Arc::clone(self),
            id: id.clone(),
            handle: Mutex::new(Some(handle)),
            guard: Mutex::new(Some(guard)),
        });
        if let Err(e) = self.fetch_queue.add(job.clone()) {
            job.handle.lock().unwrap().take();
            job.finish(Err(e.clone()));
            return Err(e);
        }
        info!("Scheduled fetch of {}", id);
        Ok(Submission::Scheduled(waiter))
    }

    /// Writes a precious replica to its HSM.
    pub async fn store(self: &Arc<Self>, id: &PnfsId) -> Result<Submission> {
        let entry = self.repository.get_entry(id)?;
        match entry.state {
            ReplicaState::Cached => return Ok(Submission::AlreadyDone),
            ReplicaState::Precious => {}
            state => {
                return Err(PoolError::InconsistentState(format!(
                    "Cannot flush {} in state {}",
                    id, state
                )))
            }
        }

        let (guard, waiter) = match self.store_tracker.try_register(id) {
            JobRole::Waiter(waiter) => {
                debug!("Joining store of {}", id);
                return Ok(Submission::Joined(waiter));
            }
            JobRole::Owner(guard, waiter) => (guard, waiter),
        };

        if self.settings().check_namespace_before_store {
            if let Err(e) = self.namespace.get_storage_info(id).await {
                if e.is_not_found() {
                    warn!("{} was deleted from the name space, removing replica", id);
                    if let Err(remove_error) = self.repository.remove(id) {
                        warn!("Failed to remove deleted replica {}: {}", id, remove_error);
                    }
                }
                guard.complete(Err(e.clone()));
                return Err(e);
            }
        }

        if let Err(e) = self.repository.lock(id, true) {
            guard.complete(Err(e.clone()));
            return Err(e);
        }

        let job = Arc::new(StoreJob {
            handler: Arc::clone(self),
            id: id.clone(),
            guard: Mutex::new(Some(guard)),
        });
        if let Err(e) = self.store_queue.add(job.clone()) {
            self.unlock(id);
            job.finish(Err(e.clone()));
            return Err(e);
        }
        info!("Scheduled store of {}", id);
        Ok(Submission::Scheduled(waiter))
    }

    pub fn fetch_jobs(&self) -> Vec<HsmJobInfo> {
        self.describe(self.fetch_queue.list())
    }

    pub fn store_jobs(&self) -> Vec<HsmJobInfo> {
        self.describe(self.store_queue.list())
    }

    fn describe(&self, jobs: Vec<JobInfo>) -> Vec<HsmJobInfo> {
        jobs.into_iter()
            .map(|job| HsmJobInfo {
                id: job.id,
                replica: self
                    .repository
                    .state(&job.pnfs_id)
                    .map_or_else(|| "<zombie>".to_string(), |s| s.to_string()),
                pnfs_id: job.pnfs_id.to_string(),
                status: job.status,
                submitted_at: job.submitted_at,
                started_at: job.started_at,
            })
            .collect()
    }

    pub fn kill_fetch(&self, job: u64) -> Result<()> {
        self.fetch_queue.kill(job)
    }

    pub fn kill_store(&self, job: u64) -> Result<()> {
        self.store_queue.kill(job)
    }

    pub fn is_fetch_registered(&self, id: &PnfsId) -> bool {
        self.fetch_tracker.is_registered(id)
    }

    pub fn is_store_registered(&self, id: &PnfsId) -> bool {
        self.store_tracker.is_registered(id)
    }

    pub fn set_max_active_fetch(&self, max: usize) {
        self.settings.write().unwrap().max_active_fetch = max;
        self.fetch_queue.set_max_active(max);
    }

    pub fn set_max_active_store(&self, max: usize) {
        self.settings.write().unwrap().max_active_store = max;
        self.store_queue.set_max_active(max);
    }

    pub fn set_fetch_timeout(&self, timeout: Duration) {
        self.settings.write().unwrap().fetch_timeout = timeout;
    }

    pub fn set_store_timeout(&self, timeout: Duration) {
        self.settings.write().unwrap().store_timeout = timeout;
    }

    pub fn fetch_queue_size(&self) -> usize {
        self.fetch_queue.queue_size()
    }

    pub fn fetch_active_count(&self) -> usize {
        self.fetch_queue.active_count()
    }

    pub fn store_queue_size(&self) -> usize {
        self.store_queue.queue_size()
    }

    pub fn store_active_count(&self) -> usize {
        self.store_queue.active_count()
    }

    /// Interrupts every running HSM command.
    pub fn cancel_all(&self) {
        self.fetch_queue.cancel_active();
        self.store_queue.cancel_active();
    }

    /// Unqueues waiting jobs, cancels running ones and waits for them to wind down.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.fetch_queue.shutdown();
        self.store_queue.shutdown();
        let fetch_idle = self.fetch_queue.wait_idle(timeout).await;
        let store_idle = self.store_queue.wait_idle(timeout).await;
        fetch_idle && store_idle
    }

    fn unlock(&self, id: &PnfsId) {
        if let Err(e) = self.repository.lock(id, false) {
            if !e.is_not_found() {
                warn!("Failed to unlock {}: {}", id, e);
            }
        }
    }

    /// Imports the checksum an HSM script may have written next to a restored file.
    async fn import_checksum(&self, handle: &mut ReplicaHandle) {
        let path = checksum_file(&handle.file());
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Failed to read checksum file {:?}: {}", path, e);
                return;
            }
        };
        if let Some(value) = content.lines().next().map(str::trim).filter(|v| !v.is_empty()) {
            let checksum = format!("{}:{}", CHECKSUM_FILE_TYPE, value);
            debug!("Imported checksum {} for {}", checksum, handle.id());
            handle.attributes_mut().storage_info.add_checksum(&checksum);
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Failed to delete checksum file {:?}: {}", path, e);
        }
    }

    async fn run_fetch(&self, handle: &mut ReplicaHandle, cancel: &CancellationToken) -> Result<u64> {
        let attributes = handle.attributes().clone();
        let hsm = self
            .hsm_set
            .find_accessible_instance(&attributes.storage_info)
            .ok_or_else(|| {
                PoolError::HsmError(format!(
                    "No HSM instance on this pool can read {} (locations {:?})",
                    attributes.id, attributes.storage_info.locations
                ))
            })?;

        tokio::select! {
            allocated = handle.allocate(attributes.size) => allocated?,
            _ = cancel.cancelled() => {
                return Err(PoolError::Unqueued(format!("Fetch of {} was killed", attributes.id)))
            }
        }

        let settings = self.settings();
        let command_line = hsm.command_line(Direction::Get, &attributes, &handle.file());
        HsmCommand::new(command_line, settings.max_output_lines, settings.fetch_timeout)
            .run(cancel)
            .await?;

        let size = tokio::fs::metadata(handle.file()).await?.len();
        if size != attributes.size {
            return Err(PoolError::InconsistentState(format!(
                "Restored {} has {} bytes but {} were expected",
                attributes.id, size, attributes.size
            )));
        }
        self.import_checksum(handle).await;
        Ok(size)
    }

    /// Returns the flushed attributes, or `None` if the replica was flushed already.
    async fn run_store(&self, id: &PnfsId, cancel: &CancellationToken) -> Result<Option<FileAttributes>> {
        let entry = self.repository.get_entry(id)?;
        match entry.state {
            ReplicaState::Cached => return Ok(None),
            ReplicaState::Precious => {}
            state => {
                return Err(PoolError::InconsistentState(format!(
                    "Cannot flush {} in state {}",
                    id, state
                )))
            }
        }

        let attributes = entry.file_attributes();
        let hsm = self
            .hsm_set
            .first_by_type(&attributes.storage_info.hsm_type)
            .ok_or_else(|| {
                PoolError::HsmError(format!(
                    "No HSM instance of type {} on this pool",
                    attributes.storage_info.hsm_type
                ))
            })?;

        let settings = self.settings();
        let output = {
            let reader = self.repository.open_entry(id)?;
            let command_line = hsm.command_line(Direction::Put, &attributes, &reader.file());
            HsmCommand::new(command_line, settings.max_output_lines, settings.store_timeout)
                .run(cancel)
                .await?
        };

        let mut storage_info = attributes.storage_info.clone();
        for line in output.stdout.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
            HsmLocation::validate(line, &hsm.hsm_type).map_err(|e| {
                error!("HSM {} reported a bad location for {}: {:?}", hsm.instance, id, line);
                e
            })?;
            storage_info.add_location(line);
        }
        self.repository.set_storage_info(id, storage_info.clone())?;

        let flushed = FileAttributes::new(id.clone(), attributes.size, storage_info);
        self.notify_namespace(&flushed, settings.notify_retry_delay).await;
        Ok(Some(flushed))
    }

    /// Reports new HSM locations to the name space, retrying until it succeeds
    /// or the file turns out to be deleted.
    async fn notify_namespace(&self, flushed: &FileAttributes, retry_delay: Duration) {
        loop {
            match self.namespace.record_flush_location(&flushed.id, flushed).await {
                Ok(()) => return,
                Err(e) if e.is_not_found() => {
                    warn!(
                        "{} was deleted while being flushed, tape copy {:?} is orphaned",
                        flushed.id, flushed.storage_info.locations
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Failed to record flush of {} in the name space, retrying in {:?}: {}",
                        flushed.id, retry_delay, e
                    );
                    self.metrics.record_notify_retry();
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    /// Marks a flushed replica cached.
    ///
    /// The tape copy is complete at this point, so a replica that left the
    /// pool or changed state meanwhile still counts as flushed.
    fn complete_store(&self, flushed: &FileAttributes) -> Result<()> {
        let info = &flushed.storage_info;
        if self.settings().retain_online_custodial
            && info.access_latency == AccessLatency::Online
            && info.retention_policy == RetentionPolicy::Custodial
        {
            info!("Flushed {}, keeping it precious (ONLINE CUSTODIAL)", flushed.id);
            return Ok(());
        }
        match self
            .repository
            .set_state(&flushed.id, ReplicaState::Cached, false)
        {
            Err(e) if e.is_not_found() || matches!(e, PoolError::IllegalTransition { .. }) => {
                info!(
                    "Flushed {}, but the replica is no longer precious: {}",
                    flushed.id, e
                );
                Ok(())
            }
            result => result,
        }
    }

    /// A failed store leaves the replica precious, unless its data file is
    /// empty or gone.
    fn cleanup_failed_store(&self, id: &PnfsId) {
        if !self.repository.contains(id) {
            return;
        }
        let path = self.repository.data_file(id);
        let on_disk = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if on_disk == 0 {
            info!("Removing empty replica {} after failed flush", id);
            if let Err(e) = self.repository.remove(id) {
                warn!("Failed to remove empty replica {}: {}", id, e);
            }
        }
    }
}

/// Path of the checksum file for a data file.
pub fn checksum_file(data_file: &Path) -> PathBuf {
    data_file.with_extension(CHECKSUM_FILE_EXTENSION)
}

struct FetchJob {
    handler: Arc<HsmStorageHandler>,
    id: PnfsId,
    handle: Mutex<Option<ReplicaHandle>>,
    guard: Mutex<Option<CompletionGuard>>,
}

impl FetchJob {
    fn finish(&self, result: Result<()>) {
        if let Some(guard) = self.guard.lock().unwrap().take() {
            guard.complete(result);
        }
    }
}

impl Job for FetchJob {
    fn pnfs_id(&self) -> &PnfsId {
        &self.id
    }

    fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        async move {
            let handle = self.handle.lock().unwrap().take();
            let mut handle = match handle {
                Some(handle) => handle,
                None => {
                    self.finish(Err(PoolError::InternalError(format!(
                        "Fetch of {} started twice",
                        self.id
                    ))));
                    return;
                }
            };

            let result = match self.handler.run_fetch(&mut handle, &cancel).await {
                Ok(size) => handle.commit().map(|_| size),
                Err(e) => {
                    // Destroys the half-written replica and releases its space
                    drop(handle);
                    Err(e)
                }
            };

            match &result {
                Ok(size) => {
                    info!("Fetched {} ({} bytes)", self.id, size);
                    self.handler.metrics.record_fetch(true, *size);
                }
                Err(PoolError::Unqueued(_)) => {
                    info!("Fetch of {} was killed", self.id);
                    self.handler.metrics.record_job_killed();
                }
                Err(e) => {
                    error!("Fetch of {} failed: {}", self.id, e);
                    self.handler.metrics.record_fetch(false, 0);
                }
            }
            self.finish(result.map(|_| ()));
        }
        .boxed()
    }

    fn unqueued(self: Arc<Self>) {
        self.handle.lock().unwrap().take();
        self.handler.metrics.record_job_killed();
        self.finish(Err(PoolError::Unqueued(format!(
            "Fetch of {} was dequeued",
            self.id
        ))));
    }
}

struct StoreJob {
    handler: Arc<HsmStorageHandler>,
    id: PnfsId,
    guard: Mutex<Option<CompletionGuard>>,
}

impl StoreJob {
    fn finish(&self, result: Result<()>) {
        if let Some(guard) = self.guard.lock().unwrap().take() {
            guard.complete(result);
        }
    }
}

impl Job for StoreJob {
    fn pnfs_id(&self) -> &PnfsId {
        &self.id
    }

    fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
        async move {
            let handler = &self.handler;
            let result = match handler.run_store(&self.id, &cancel).await {
                Ok(Some(flushed)) => handler.complete_store(&flushed).map(|_| flushed.size),
                Ok(None) => Ok(0),
                Err(e) if e.is_not_found() => {
                    info!("Flush of {} aborted, the replica was deleted: {}", self.id, e);
                    Ok(0)
                }
                Err(e) => Err(e),
            };
            // Cleanup needs the protection flag cleared to remove the replica
            handler.unlock(&self.id);
            if result.is_err() {
                handler.cleanup_failed_store(&self.id);
            }

            match &result {
                Ok(size) => {
                    info!("Flushed {} ({} bytes)", self.id, size);
                    handler.metrics.record_store(true, *size);
                }
                Err(PoolError::Unqueued(_)) => {
                    info!("Flush of {} was killed", self.id);
                    handler.metrics.record_job_killed();
                }
                Err(e) => {
                    error!("Flush of {} failed: {}", self.id, e);
                    handler.metrics.record_store(false, 0);
                }
            }
            self.finish(result.map(|_| ()));
        }
        .boxed()
    }

    fn unqueued(self: Arc<Self>) {
        self.handler.unlock(&self.id);
        self.handler.metrics.record_job_killed();
        self.finish(Err(PoolError::Unqueued(format!(
            "Flush of {} was dequeued",
            self.id
        ))));
    }
}
