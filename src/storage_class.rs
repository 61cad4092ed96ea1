//! Storage Class Module
//!
//! One flush queue per (HSM type, storage class). Precious replicas wait here
//! until the queue is triggered by its age or size thresholds and the flush
//! controller submits a batch of them to the storage handler.
//!
//! Entries live in one of two subsets:
//! - **active**: ordered by creation time, counted in the queue's total size
//! - **failed**: parked after a transient HSM failure until re-activated
//!
//! At most one batch is in flight per queue.

use crate::inflight_tracker::JobResult;
use crate::replica_types::{FlushEntry, PnfsId, StorageInfo};
use crate::storage_handler::{HsmStorageHandler, Submission};
use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Queue key, rendered as `class@hsm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageClassKey {
    pub hsm: String,
    pub storage_class: String,
}

impl StorageClassKey {
    pub fn new(hsm: &str, storage_class: &str) -> Self {
        Self {
            hsm: hsm.to_string(),
            storage_class: storage_class.to_string(),
        }
    }

    pub fn of(storage_info: &StorageInfo) -> Self {
        Self::new(&storage_info.hsm_type, &storage_info.storage_class)
    }

    /// Parses `class@hsm`. The class itself may contain `@`.
    pub fn parse(key: &str) -> Result<Self> {
        match key.rsplit_once('@') {
            Some((class, hsm)) if !class.is_empty() && !hsm.is_empty() => Ok(Self::new(hsm, class)),
            _ => Err(PoolError::InvalidRequest(format!(
                "Storage class must be given as class@hsm: {:?}",
                key
            ))),
        }
    }
}

impl fmt::Display for StorageClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.storage_class, self.hsm)
    }
}

/// Flush thresholds of a queue.
///
/// `pending_count` and `max_bytes` of 0 are disabled. A `max_age` of 0 lets a
/// queue expire as soon as it holds a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageClassSettings {
    pub pending_count: usize,
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for StorageClassSettings {
    fn default() -> Self {
        Self {
            pending_count: 0,
            max_bytes: 0,
            max_age: Duration::from_secs(60),
        }
    }
}

/// Result of a finished batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOutcome {
    pub key: StorageClassKey,
    pub requests: usize,
    pub failures: usize,
}

/// Invoked once per batch, on its own task.
pub type FlushCallback = Box<dyn FnOnce(FlushOutcome) + Send + 'static>;

/// Admin view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClassStatus {
    pub key: String,
    pub requests: usize,
    pub failed: usize,
    pub total_size: u64,
    pub error_count: u64,
    pub in_flight: usize,
    pub active: bool,
    pub suspended: bool,
    pub pending_count: usize,
    pub max_bytes: u64,
    pub max_age_secs: u64,
    pub oldest_age_secs: Option<u64>,
}

struct Batch {
    requests: usize,
    failures: usize,
    in_flight: usize,
    /// Set while `submit` is still handing entries to the storage handler.
    dispatching: bool,
    callback: Option<FlushCallback>,
}

#[derive(Default)]
struct ClassState {
    active: BTreeMap<(SystemTime, PnfsId), FlushEntry>,
    /// Creation time of every active entry, to locate it in `active`.
    positions: HashMap<PnfsId, SystemTime>,
    failed: HashMap<PnfsId, FlushEntry>,
    total_size: u64,
    settings: StorageClassSettings,
    suspended: bool,
    batch: Option<Batch>,
    error_count: u64,
    last_submitted: Option<SystemTime>,
}

impl ClassState {
    fn contains(&self, id: &PnfsId) -> bool {
        self.positions.contains_key(id) || self.failed.contains_key(id)
    }

    fn insert_active(&mut self, entry: FlushEntry) {
        self.total_size += entry.size;
        self.positions.insert(entry.id.clone(), entry.created_at);
        self.active.insert((entry.created_at, entry.id.clone()), entry);
    }

    fn remove_active(&mut self, id: &PnfsId) -> Option<FlushEntry> {
        let created_at = self.positions.remove(id)?;
        let entry = self.active.remove(&(created_at, id.clone()))?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(entry)
    }

    fn oldest(&self) -> Option<SystemTime> {
        self.active.keys().next().map(|(created_at, _)| *created_at)
    }

    fn is_full(&self) -> bool {
        let settings = &self.settings;
        (settings.pending_count > 0 && self.active.len() >= settings.pending_count)
            || (settings.max_bytes > 0 && self.total_size >= settings.max_bytes)
    }

    fn has_expired_at(&self, now: SystemTime) -> bool {
        match self.oldest() {
            Some(oldest) => now.duration_since(oldest).unwrap_or_default() >= self.settings.max_age,
            None => false,
        }
    }

    /// Takes the batch once its last request completed.
    fn take_finished_batch(&mut self) -> Option<Batch> {
        match &self.batch {
            Some(batch) if batch.in_flight == 0 && !batch.dispatching => self.batch.take(),
            _ => None,
        }
    }
}

pub struct StorageClassInfo {
    key: StorageClassKey,
    state: Mutex<ClassState>,
}

impl StorageClassInfo {
    pub fn new(key: StorageClassKey, settings: StorageClassSettings) -> Self {
        Self {
            key,
            state: Mutex::new(ClassState {
                settings,
                ..Default::default()
            }),
        }
    }

    pub fn key(&self) -> &StorageClassKey {
        &self.key
    }

    /// Queues a replica. Fails if it is already queued, active or failed.
    pub fn add_request(&self, entry: FlushEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.contains(&entry.id) {
            return Err(PoolError::InvalidRequest(format!(
                "{} is already queued in {}",
                entry.id, self.key
            )));
        }
        debug!("Queued {} ({} bytes) for flush to {}", entry.id, entry.size, self.key);
        state.insert_active(entry);
        Ok(())
    }

    /// Removes a replica from either subset.
    pub fn remove_request(&self, id: &PnfsId) -> Option<FlushEntry> {
        let mut state = self.state.lock().unwrap();
        let removed = state.remove_active(id).or_else(|| state.failed.remove(id));
        if removed.is_some() {
            debug!("Removed {} from flush queue {}", id, self.key);
        }
        removed
    }

    pub fn contains(&self, id: &PnfsId) -> bool {
        self.state.lock().unwrap().contains(id)
    }

    /// Moves a failed request back into the active subset.
    pub fn activate(&self, id: &PnfsId) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.failed.remove(id) {
            Some(entry) => {
                state.insert_active(entry);
                true
            }
            None => false,
        }
    }

    /// Moves every failed request back into the active subset.
    pub fn activate_all(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let failed: Vec<FlushEntry> = state.failed.drain().map(|(_, e)| e).collect();
        let count = failed.len();
        for entry in failed {
            state.insert_active(entry);
        }
        count
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().unwrap().is_full()
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(SystemTime::now())
    }

    pub fn has_expired_at(&self, now: SystemTime) -> bool {
        self.state.lock().unwrap().has_expired_at(now)
    }

    pub fn is_triggered(&self) -> bool {
        self.is_triggered_at(SystemTime::now())
    }

    pub fn is_triggered_at(&self, now: SystemTime) -> bool {
        let state = self.state.lock().unwrap();
        (state.has_expired_at(now) || state.is_full()) && !state.suspended
    }

    /// Whether a batch is in flight.
    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().batch.is_some()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.state.lock().unwrap().suspended = suspended;
        info!(
            "Flush queue {} {}",
            self.key,
            if suspended { "suspended" } else { "resumed" }
        );
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    pub fn settings(&self) -> StorageClassSettings {
        self.state.lock().unwrap().settings
    }

    pub fn set_settings(&self, settings: StorageClassSettings) {
        self.state.lock().unwrap().settings = settings;
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn failed_count(&self) -> usize {
        self.state.lock().unwrap().failed.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.active.is_empty() && state.failed.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.state.lock().unwrap().total_size
    }

    pub fn error_count(&self) -> u64 {
        self.state.lock().unwrap().error_count
    }

    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .batch
            .as_ref()
            .map_or(0, |b| b.in_flight)
    }

    pub fn last_submitted(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().last_submitted
    }

    /// Active request ids, oldest first.
    pub fn request_ids(&self) -> Vec<PnfsId> {
        self.state
            .lock()
            .unwrap()
            .active
            .values()
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn status(&self) -> StorageClassStatus {
        let now = SystemTime::now();
        let state = self.state.lock().unwrap();
        StorageClassStatus {
            key: self.key.to_string(),
            requests: state.active.len(),
            failed: state.failed.len(),
            total_size: state.total_size,
            error_count: state.error_count,
            in_flight: state.batch.as_ref().map_or(0, |b| b.in_flight),
            active: state.batch.is_some(),
            suspended: state.suspended,
            pending_count: state.settings.pending_count,
            max_bytes: state.settings.max_bytes,
            max_age_secs: state.settings.max_age.as_secs(),
            oldest_age_secs: state
                .oldest()
                .map(|oldest| now.duration_since(oldest).unwrap_or_default().as_secs()),
        }
    }

    /// Hands up to `max_count` of the oldest active requests to the storage
    /// handler as one batch. Returns the number of store jobs the batch waits for.
    ///
    /// Replicas the handler reports as already flushed are dropped from the
    /// queue right away. `callback` runs once, on its own task, after the last
    /// job of the batch completed.
    pub async fn submit(
        self: &Arc<Self>,
        handler: &Arc<HsmStorageHandler>,
        max_count: usize,
        callback: Option<FlushCallback>,
    ) -> Result<usize> {
        let ids: Vec<PnfsId> = {
            let mut state = self.state.lock().unwrap();
            if state.batch.is_some() {
                return Err(PoolError::InvalidRequest(format!(
                    "Flush of {} is already in progress",
                    self.key
                )));
            }
            state.batch = Some(Batch {
                requests: 0,
                failures: 0,
                in_flight: 0,
                dispatching: true,
                callback,
            });
            state.last_submitted = Some(SystemTime::now());
            state
                .active
                .values()
                .take(max_count)
                .map(|e| e.id.clone())
                .collect()
        };
        info!("Flushing {} replicas of {}", ids.len(), self.key);

        for id in ids {
            match handler.store(&id).await {
                Ok(Submission::AlreadyDone) => {
                    debug!("{} is already flushed", id);
                    self.remove_request(&id);
                }
                Ok(Submission::Scheduled(waiter)) | Ok(Submission::Joined(waiter)) => {
                    self.begin_request();
                    let info = Arc::clone(self);
                    tokio::spawn(async move {
                        let result = waiter.wait().await;
                        info.on_replica_flushed(&id, result);
                    });
                }
                Err(e) => {
                    self.begin_request();
                    self.on_replica_flushed(&id, Err(e));
                }
            }
        }

        let (requests, finished) = {
            let mut state = self.state.lock().unwrap();
            let requests = match state.batch.as_mut() {
                Some(batch) => {
                    batch.dispatching = false;
                    batch.requests
                }
                None => 0,
            };
            (requests, state.take_finished_batch())
        };
        if let Some(batch) = finished {
            self.complete_batch(batch);
        }
        Ok(requests)
    }

    fn begin_request(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.batch.as_mut() {
            batch.requests += 1;
            batch.in_flight += 1;
        }
    }

    /// Records the outcome of one store job.
    ///
    /// Success drops the request. A transient failure parks it in the failed
    /// subset; any other failure leaves it queued and counts an error.
    pub fn on_replica_flushed(&self, id: &PnfsId, result: JobResult) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            match &result {
                Ok(()) => {
                    state.remove_active(id);
                    state.failed.remove(id);
                }
                Err(e) if e.is_transient() => {
                    if let Some(entry) = state.remove_active(id) {
                        state.failed.insert(id.clone(), entry);
                    }
                    warn!("Flush of {} to {} failed, will retry: {}", id, self.key, e);
                }
                Err(e) => {
                    state.error_count += 1;
                    warn!("Flush of {} to {} failed: {}", id, self.key, e);
                }
            }
            if let Some(batch) = state.batch.as_mut() {
                batch.in_flight = batch.in_flight.saturating_sub(1);
                if result.is_err() {
                    batch.failures += 1;
                }
            }
            state.take_finished_batch()
        };
        if let Some(batch) = finished {
            self.complete_batch(batch);
        }
    }

    fn complete_batch(&self, batch: Batch) {
        let outcome = FlushOutcome {
            key: self.key.clone(),
            requests: batch.requests,
            failures: batch.failures,
        };
        info!(
            "Flush of {} finished: {} requests, {} failures",
            self.key, outcome.requests, outcome.failures
        );
        if let Some(callback) = batch.callback {
            tokio::spawn(async move { callback(outcome) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StorageClassKey {
        StorageClassKey::new("osm", "raw")
    }

    fn entry(n: u32, created_at: SystemTime, size: u64) -> FlushEntry {
        FlushEntry {
            id: PnfsId::new(&format!("{:04X}", n)).unwrap(),
            created_at,
            size,
        }
    }

    fn info(settings: StorageClassSettings) -> StorageClassInfo {
        StorageClassInfo::new(key(), settings)
    }

    #[test]
    fn test_key_parse_and_display() {
        let key = StorageClassKey::parse("exp:raw@osm").unwrap();
        assert_eq!(key.hsm, "osm");
        assert_eq!(key.storage_class, "exp:raw");
        assert_eq!(key.to_string(), "exp:raw@osm");
        assert!(StorageClassKey::parse("noclass").is_err());
        assert!(StorageClassKey::parse("@osm").is_err());
    }

    #[test]
    fn test_pending_count_triggers() {
        let queue = info(StorageClassSettings {
            pending_count: 3,
            max_bytes: 0,
            max_age: Duration::from_secs(3600),
        });
        let now = SystemTime::now();
        queue.add_request(entry(1, now, 10)).unwrap();
        queue.add_request(entry(2, now, 10)).unwrap();
        assert!(!queue.is_triggered_at(now));

        queue.add_request(entry(3, now, 10)).unwrap();
        assert!(queue.is_full());
        assert!(queue.is_triggered_at(now));
    }

    #[test]
    fn test_max_age_expires() {
        let queue = info(StorageClassSettings {
            pending_count: 0,
            max_bytes: 0,
            max_age: Duration::from_secs(60),
        });
        let created = SystemTime::now();
        assert!(!queue.has_expired_at(created + Duration::from_secs(3600)));

        queue.add_request(entry(1, created, 10)).unwrap();
        assert!(!queue.has_expired_at(created + Duration::from_secs(30)));
        let later = created + Duration::from_secs(61);
        assert!(queue.has_expired_at(later));
        assert!(queue.is_triggered_at(later));
    }

    #[test]
    fn test_max_bytes_and_suspension() {
        let queue = info(StorageClassSettings {
            pending_count: 0,
            max_bytes: 100,
            max_age: Duration::from_secs(3600),
        });
        let now = SystemTime::now();
        queue.add_request(entry(1, now, 60)).unwrap();
        assert!(!queue.is_full());
        queue.add_request(entry(2, now, 40)).unwrap();
        assert!(queue.is_triggered_at(now));

        queue.set_suspended(true);
        assert!(!queue.is_triggered_at(now));
        queue.set_suspended(false);
        assert!(queue.is_triggered_at(now));
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let queue = info(StorageClassSettings::default());
        let now = SystemTime::now();
        queue.add_request(entry(1, now, 10)).unwrap();
        assert!(queue.add_request(entry(1, now, 10)).is_err());

        // Also rejected while parked in the failed subset
        queue.on_replica_flushed(
            &entry(1, now, 10).id,
            Err(PoolError::HsmCommandFailed {
                code: 32,
                message: "drive busy".to_string(),
            }),
        );
        assert_eq!(queue.failed_count(), 1);
        assert!(queue.add_request(entry(1, now, 10)).is_err());
    }

    #[test]
    fn test_requests_are_ordered_by_creation_time() {
        let queue = info(StorageClassSettings::default());
        let base = SystemTime::now();
        queue.add_request(entry(3, base + Duration::from_secs(2), 1)).unwrap();
        queue.add_request(entry(1, base, 1)).unwrap();
        queue.add_request(entry(2, base + Duration::from_secs(1), 1)).unwrap();

        let ids: Vec<String> = queue.request_ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["0001", "0002", "0003"]);
    }

    #[test]
    fn test_transient_failure_parks_request() {
        let queue = info(StorageClassSettings::default());
        let now = SystemTime::now();
        let e = entry(1, now, 25);
        queue.add_request(e.clone()).unwrap();

        queue.on_replica_flushed(
            &e.id,
            Err(PoolError::HsmCommandFailed {
                code: 35,
                message: "library offline".to_string(),
            }),
        );
        assert_eq!(queue.request_count(), 0);
        assert_eq!(queue.failed_count(), 1);
        assert_eq!(queue.total_size(), 0);
        assert!(!queue.has_expired_at(now + Duration::from_secs(3600)));

        assert!(queue.activate(&e.id));
        assert_eq!(queue.request_count(), 1);
        assert_eq!(queue.total_size(), 25);
    }

    #[test]
    fn test_permanent_failure_counts_error() {
        let queue = info(StorageClassSettings::default());
        let e = entry(1, SystemTime::now(), 25);
        queue.add_request(e.clone()).unwrap();

        queue.on_replica_flushed(
            &e.id,
            Err(PoolError::HsmCommandFailed {
                code: 1,
                message: "bad tape".to_string(),
            }),
        );
        assert_eq!(queue.request_count(), 1);
        assert_eq!(queue.failed_count(), 0);
        assert_eq!(queue.error_count(), 1);

        queue.on_replica_flushed(&e.id, Ok(()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_activate_all_and_remove() {
        let queue = info(StorageClassSettings::default());
        let now = SystemTime::now();
        for n in 1..=3 {
            queue.add_request(entry(n, now, 10)).unwrap();
            queue.on_replica_flushed(
                &entry(n, now, 10).id,
                Err(PoolError::HsmCommandFailed {
                    code: 30,
                    message: String::new(),
                }),
            );
        }
        assert_eq!(queue.failed_count(), 3);
        assert_eq!(queue.activate_all(), 3);
        assert_eq!(queue.total_size(), 30);

        assert!(queue.remove_request(&entry(2, now, 10).id).is_some());
        assert!(queue.remove_request(&entry(2, now, 10).id).is_none());
        assert_eq!(queue.total_size(), 20);
        assert_eq!(queue.status().requests, 2);
    }
}
