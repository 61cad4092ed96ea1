//! Replica Repository Module
//!
//! The authoritative store of replica state. Every replica lives as a data file
//! under `<pool>/data/<id>` plus a metadata record. The repository enforces the
//! replica state machine:
//!
//! ```text
//! [ReceivingFromClient] --commit--> Precious | Cached
//! [ReceivingFromStore]  --commit--> Cached
//! Precious --flushed--> Cached
//! Cached   --forced---> Precious
//! any (link count 0, unlocked) --remove--> destroyed
//! ```
//!
//! # Events
//!
//! Every mutation emits one [`ReplicaEvent`] to all registered listeners before
//! the call returns. Mutations and the delivery of their events are serialised,
//! so listeners observe the events of one replica in mutation order. Listeners
//! may read from the repository but must not mutate it from within `on_event`.
//!
//! # Accounting
//!
//! Precious and removable byte counters in the [`Account`] are adjusted on
//! every mutation from the difference between the record before and after it.

use crate::account::Account;
use crate::metadata_store::{MetaDataStore, ReplicaRecord};
use crate::namespace::NameSpace;
use crate::replica_types::{CacheEntry, FileAttributes, PnfsId, ReplicaState, StickyRecord};
use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

/// Lifecycle notification emitted by the repository.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    /// A replica entered a receiving state.
    Created(CacheEntry),
    /// A replica was found on disk by the inventory.
    Scanned(CacheEntry),
    Precious(CacheEntry),
    Cached(CacheEntry),
    /// Link count, protection flag or access time changed.
    Touched(CacheEntry),
    Sticky(CacheEntry),
    /// The replica was destroyed. Carries its last state.
    Removed(CacheEntry),
    /// An allocation is waiting for this many bytes.
    NeedSpace(u64),
}

impl ReplicaEvent {
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            ReplicaEvent::Created(e)
            | ReplicaEvent::Scanned(e)
            | ReplicaEvent::Precious(e)
            | ReplicaEvent::Cached(e)
            | ReplicaEvent::Touched(e)
            | ReplicaEvent::Sticky(e)
            | ReplicaEvent::Removed(e) => Some(e),
            ReplicaEvent::NeedSpace(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplicaEvent::Created(_) => "created",
            ReplicaEvent::Scanned(_) => "scanned",
            ReplicaEvent::Precious(_) => "precious",
            ReplicaEvent::Cached(_) => "cached",
            ReplicaEvent::Touched(_) => "touched",
            ReplicaEvent::Sticky(_) => "sticky",
            ReplicaEvent::Removed(_) => "removed",
            ReplicaEvent::NeedSpace(_) => "needSpace",
        }
    }
}

/// Receives repository events synchronously.
pub trait ReplicaListener: Send + Sync {
    fn on_event(&self, event: &ReplicaEvent);
}

/// Outcome of an inventory pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReport {
    /// Replicas added to the repository.
    pub loaded: usize,
    /// Broken or orphaned replicas deleted from disk.
    pub removed: usize,
    /// Replicas that were already known.
    pub skipped: usize,
}

pub struct ReplicaRepository {
    data_dir: PathBuf,
    metadata: Box<dyn MetaDataStore>,
    account: Arc<Account>,
    records: Mutex<HashMap<PnfsId, ReplicaRecord>>,
    /// Serialises mutations together with the delivery of their events.
    event_lock: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn ReplicaListener>>>,
    volatile: AtomicBool,
    sticky_allowed: AtomicBool,
    allocation_blocking: AtomicBool,
}

impl ReplicaRepository {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        metadata: Box<dyn MetaDataStore>,
        account: Arc<Account>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            PoolError::IoError(format!("Failed to create data directory {:?}: {}", data_dir, e))
        })?;
        Ok(Self {
            data_dir,
            metadata,
            account,
            records: Mutex::new(HashMap::new()),
            event_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            volatile: AtomicBool::new(false),
            sticky_allowed: AtomicBool::new(true),
            allocation_blocking: AtomicBool::new(true),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn ReplicaListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Drops all listeners, breaking reference cycles on shutdown.
    pub fn clear_listeners(&self) {
        self.listeners.write().unwrap().clear();
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    /// In volatile mode every completed replica becomes `Cached`.
    pub fn set_volatile(&self, volatile: bool) {
        self.volatile.store(volatile, Ordering::Relaxed);
    }

    pub fn is_volatile(&self) -> bool {
        self.volatile.load(Ordering::Relaxed)
    }

    pub fn set_sticky_allowed(&self, allowed: bool) {
        self.sticky_allowed.store(allowed, Ordering::Relaxed);
    }

    pub fn is_sticky_allowed(&self) -> bool {
        self.sticky_allowed.load(Ordering::Relaxed)
    }

    pub fn set_allocation_blocking(&self, blocking: bool) {
        self.allocation_blocking.store(blocking, Ordering::Relaxed);
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn data_file(&self, id: &PnfsId) -> PathBuf {
        self.data_dir.join(id.as_str())
    }

    pub fn get_entry(&self, id: &PnfsId) -> Result<CacheEntry> {
        self.records
            .lock()
            .unwrap()
            .get(id)
            .map(ReplicaRecord::to_entry)
            .ok_or_else(|| PoolError::FileNotInCache(id.to_string()))
    }

    pub fn state(&self, id: &PnfsId) -> Option<ReplicaState> {
        self.records.lock().unwrap().get(id).map(|r| r.state)
    }

    pub fn contains(&self, id: &PnfsId) -> bool {
        self.records.lock().unwrap().contains_key(id)
    }

    pub fn ids(&self) -> Vec<PnfsId> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.records
            .lock()
            .unwrap()
            .values()
            .map(ReplicaRecord::to_entry)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a replica in a receiving state.
    ///
    /// The returned handle holds a link on the replica. Committing the handle
    /// moves the replica to `target`; dropping it uncommitted destroys it.
    pub fn create_entry(
        self: &Arc<Self>,
        attributes: FileAttributes,
        initial: ReplicaState,
        target: ReplicaState,
        sticky: Vec<StickyRecord>,
    ) -> Result<ReplicaHandle> {
        if !initial.is_receiving() {
            return Err(PoolError::InvalidRequest(format!(
                "Replica must be created in a receiving state, not {}",
                initial
            )));
        }
        if target.is_receiving() {
            return Err(PoolError::InvalidRequest(format!(
                "Invalid target state {}",
                target
            )));
        }

        let id = attributes.id.clone();
        let _serial = self.event_lock.lock().unwrap();
        let entry = {
            let mut records = self.records.lock().unwrap();
            if records.contains_key(&id) {
                return Err(PoolError::FileInCache(id.to_string()));
            }

            let path = self.data_file(&id);
            std::fs::File::create(&path).map_err(|e| {
                PoolError::IoError(format!("Failed to create data file {:?}: {}", path, e))
            })?;

            let mut record =
                ReplicaRecord::new(id.clone(), initial, attributes.storage_info.clone());
            record.link_count = 1;
            self.persist(&record);
            let entry = record.to_entry();
            records.insert(id.clone(), record);
            entry
        };
        debug!("Created replica {} in state {}", id, initial);
        self.emit(&ReplicaEvent::Created(entry));

        Ok(ReplicaHandle {
            repository: Arc::clone(self),
            attributes,
            target,
            sticky,
            allocated: 0,
            committed: false,
        })
    }

    /// Opens a complete replica for reading.
    pub fn open_entry(self: &Arc<Self>, id: &PnfsId) -> Result<ReadHandle> {
        let now = SystemTime::now();
        let entry = self.update(id, |record| {
            if record.state.is_receiving() {
                return Err(PoolError::FileNotInCache(format!("{} is incomplete", id)));
            }
            record.link_count += 1;
            record.last_accessed_at = now;
            Ok(record.to_entry())
        })?;
        Ok(ReadHandle {
            repository: Arc::clone(self),
            entry,
        })
    }

    /// Changes the state of a complete replica.
    ///
    /// `Cached -> Precious` requires `force`. Receiving replicas can only leave
    /// their state through [`ReplicaHandle::commit`].
    pub fn set_state(&self, id: &PnfsId, state: ReplicaState, force: bool) -> Result<()> {
        let now = SystemTime::now();
        self.update(id, |record| {
            match (record.state, state) {
                (from, to) if from == to => return Ok(()),
                (ReplicaState::Precious, ReplicaState::Cached) => {}
                (ReplicaState::Cached, ReplicaState::Precious) if force => {
                    info!("Marking cached replica {} precious by request", id);
                }
                (from, to) => {
                    return Err(PoolError::IllegalTransition {
                        id: id.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                    })
                }
            }
            record.state = state;
            record.last_accessed_at = now;
            Ok(())
        })
    }

    /// Sets or updates the sticky record of `owner`.
    ///
    /// An expiry in the past removes the owner's record. Without `overwrite`
    /// an existing record is only extended, never shortened.
    pub fn set_sticky(
        &self,
        id: &PnfsId,
        owner: &str,
        expires_at: Option<SystemTime>,
        overwrite: bool,
    ) -> Result<()> {
        if !self.is_sticky_allowed() {
            return Err(PoolError::InvalidRequest(
                "Sticky flags are disabled on this pool".to_string(),
            ));
        }
        let now = SystemTime::now();
        self.update(id, |record| {
            if record.state.is_receiving() {
                return Err(PoolError::FileNotInCache(format!("{} is incomplete", id)));
            }
            let valid = expires_at.map_or(true, |t| t > now);
            match record.sticky.iter().position(|s| s.owner == owner) {
                Some(i) if !valid => {
                    record.sticky.remove(i);
                }
                Some(i) => {
                    if overwrite || extends(expires_at, record.sticky[i].expires_at) {
                        record.sticky[i].expires_at = expires_at;
                    }
                }
                None if valid => record.sticky.push(StickyRecord::new(owner, expires_at)),
                None => {}
            }
            Ok(())
        })
    }

    /// Drops sticky records that expired before `now`. Returns the number of
    /// replicas that changed.
    pub fn remove_expired_sticky(&self, now: SystemTime) -> usize {
        let expired: Vec<PnfsId> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.sticky.iter().any(|s| !s.is_valid_at(now)))
            .map(|r| r.id.clone())
            .collect();

        let mut changed = 0;
        for id in expired {
            let result = self.update(&id, |record| {
                record.sticky.retain(|s| s.is_valid_at(now));
                Ok(())
            });
            match result {
                Ok(()) => changed += 1,
                Err(e) => debug!("Skipping sticky expiry of {}: {}", id, e),
            }
        }
        if changed > 0 {
            debug!("Expired sticky records on {} replicas", changed);
        }
        changed
    }

    /// Sets or clears the protection flag that keeps a replica from being removed.
    pub fn lock(&self, id: &PnfsId, locked: bool) -> Result<()> {
        self.update(id, |record| {
            record.locked = locked;
            Ok(())
        })
    }

    pub fn set_storage_info(&self, id: &PnfsId, storage_info: crate::replica_types::StorageInfo) -> Result<()> {
        self.update(id, |record| {
            record.storage_info = storage_info;
            Ok(())
        })
    }

    /// Destroys a replica and frees its space. Returns the freed bytes.
    ///
    /// Fails with `Locked` while the replica is in use or protected.
    pub fn remove(&self, id: &PnfsId) -> Result<u64> {
        let _serial = self.event_lock.lock().unwrap();
        let entry = {
            let mut records = self.records.lock().unwrap();
            let record = records
                .get(id)
                .ok_or_else(|| PoolError::FileNotInCache(id.to_string()))?;
            if record.link_count > 0 || record.locked {
                return Err(PoolError::Locked(format!(
                    "{} (links={}, locked={})",
                    id, record.link_count, record.locked
                )));
            }
            let record = match records.remove(id) {
                Some(record) => record,
                None => return Err(PoolError::FileNotInCache(id.to_string())),
            };
            self.account_for(Some(&record), None);
            record.to_entry()
        };

        self.delete_files(id);
        self.account.free(entry.size);
        info!("Removed replica {} ({} bytes, {})", id, entry.size, entry.state);
        self.emit(&ReplicaEvent::Removed(entry.clone()));
        Ok(entry.size)
    }

    /// Describes a violation of the space accounting invariant, if any.
    pub fn check_consistency(&self) -> Option<String> {
        let problem = self.account.check_consistency();
        if let Some(problem) = &problem {
            warn!("Space accounting inconsistency: {}", problem);
        }
        problem
    }

    /// Re-scans the pool after a restart and reconciles it with the name space.
    ///
    /// Replicas already known to the repository are left alone, so the pass can
    /// be repeated safely.
    pub async fn load(&self, namespace: &dyn NameSpace) -> Result<InventoryReport> {
        info!("Starting inventory of {:?}", self.data_dir);
        let mut report = InventoryReport::default();
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for mut record in self.metadata.list()? {
            seen.insert(record.id.clone());
            if self.contains(&record.id) {
                report.skipped += 1;
                continue;
            }

            let size = match std::fs::metadata(self.data_file(&record.id)) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    warn!("Replica {} has metadata but no data, dropping it", record.id);
                    self.delete_files(&record.id);
                    report.removed += 1;
                    continue;
                }
            };

            match record.state {
                ReplicaState::ReceivingFromStore => {
                    info!("Removing incomplete restore of {}", record.id);
                    self.delete_files(&record.id);
                    report.removed += 1;
                    continue;
                }
                ReplicaState::ReceivingFromClient => {
                    if !self.recover_upload(namespace, &record.id, size).await? {
                        self.delete_files(&record.id);
                        report.removed += 1;
                        continue;
                    }
                    record.state = ReplicaState::Precious;
                }
                ReplicaState::Precious | ReplicaState::Cached => {}
            }

            if record.size != size {
                warn!(
                    "Size of {} on disk is {} bytes, metadata says {}",
                    record.id, size, record.size
                );
                record.size = size;
            }
            found.push(record);
        }

        for dir_entry in walkdir::WalkDir::new(&self.data_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = dir_entry.file_name().to_string_lossy().to_string();
            let id = match PnfsId::new(&name) {
                Ok(id) => id,
                Err(_) => {
                    warn!("Ignoring unexpected file {:?} in data directory", dir_entry.path());
                    continue;
                }
            };
            if seen.contains(&id) || self.contains(&id) {
                continue;
            }

            let meta = dir_entry.metadata().map_err(|e| {
                PoolError::IoError(format!("Failed to stat {:?}: {}", dir_entry.path(), e))
            })?;
            match namespace.get_storage_info(&id).await {
                Ok(attributes) => {
                    let state = if attributes.storage_info.is_stored() {
                        ReplicaState::Cached
                    } else {
                        ReplicaState::Precious
                    };
                    info!("Recovered replica {} without metadata as {}", id, state);
                    let mut record = ReplicaRecord::new(id, state, attributes.storage_info);
                    record.size = meta.len();
                    if let Ok(modified) = meta.modified() {
                        record.created_at = modified;
                        record.last_accessed_at = modified;
                    }
                    found.push(record);
                }
                Err(e) if e.is_not_found() => {
                    info!("Removing replica {} of deleted file", id);
                    self.delete_files(&id);
                    report.removed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        found.sort_by_key(|r| r.last_accessed_at);
        for record in found {
            let _serial = self.event_lock.lock().unwrap();
            let entry = {
                let mut records = self.records.lock().unwrap();
                if records.contains_key(&record.id) {
                    report.skipped += 1;
                    continue;
                }
                self.account.grow_used(record.size);
                self.account_for(None, Some(&record));
                self.persist(&record);
                let entry = record.to_entry();
                records.insert(record.id.clone(), record);
                entry
            };
            self.emit(&ReplicaEvent::Scanned(entry));
            report.loaded += 1;
        }

        self.check_consistency();
        info!(
            "Inventory complete: {} loaded, {} removed, {} skipped",
            report.loaded, report.removed, report.skipped
        );
        Ok(report)
    }

    /// Decides whether an interrupted client upload can be kept.
    async fn recover_upload(&self, namespace: &dyn NameSpace, id: &PnfsId, size: u64) -> Result<bool> {
        match namespace.get_storage_info(id).await {
            Ok(attributes) if attributes.size == size => Ok(true),
            Ok(attributes) if attributes.size == 0 => {
                if let Err(e) = namespace.set_file_size(id, size).await {
                    warn!("Failed to set size of {} in name space: {}", id, e);
                }
                Ok(true)
            }
            Ok(attributes) => {
                warn!(
                    "Incomplete upload of {}: {} bytes on disk, {} expected",
                    id, size, attributes.size
                );
                Ok(false)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn allocate(&self, size: u64) -> Result<()> {
        let blocking = self.allocation_blocking.load(Ordering::Relaxed);
        self.account
            .allocate(size, blocking, |missing| {
                self.emit(&ReplicaEvent::NeedSpace(missing))
            })
            .await
    }

    fn commit_entry(
        &self,
        attributes: &FileAttributes,
        target: ReplicaState,
        sticky: &[StickyRecord],
        allocated: &mut u64,
    ) -> Result<CacheEntry> {
        let id = &attributes.id;
        let path = self.data_file(id);
        let actual = std::fs::metadata(&path)
            .map_err(|e| PoolError::IoError(format!("Failed to stat {:?}: {}", path, e)))?
            .len();

        if actual > *allocated {
            if !self.account.try_allocate(actual - *allocated) {
                return Err(PoolError::NoSpace(format!(
                    "{} grew to {} bytes beyond its allocation of {}",
                    id, actual, allocated
                )));
            }
        } else if actual < *allocated {
            self.account.free(*allocated - actual);
        }
        *allocated = actual;

        let state = if actual == 0 || self.is_volatile() {
            ReplicaState::Cached
        } else {
            target
        };
        let now = SystemTime::now();
        let sticky: Vec<StickyRecord> = if self.is_sticky_allowed() {
            sticky.iter().filter(|s| s.is_valid_at(now)).cloned().collect()
        } else {
            Vec::new()
        };

        self.update(id, |record| {
            if !record.state.is_receiving() {
                return Err(PoolError::InconsistentState(format!(
                    "{} is {} but should be receiving",
                    id, record.state
                )));
            }
            record.size = actual;
            record.state = state;
            record.link_count = record.link_count.saturating_sub(1);
            record.sticky = sticky;
            record.storage_info = attributes.storage_info.clone();
            record.last_accessed_at = now;
            Ok(record.to_entry())
        })
    }

    /// Destroys a replica whose creation was not committed.
    fn abort_entry(&self, id: &PnfsId, allocated: u64) {
        let _serial = self.event_lock.lock().unwrap();
        let entry = {
            let mut records = self.records.lock().unwrap();
            match records.get(id) {
                Some(record) if record.state.is_receiving() => {}
                Some(record) => {
                    error!(
                        "Refusing to roll back {} in state {}, leaving it for the next inventory",
                        id, record.state
                    );
                    return;
                }
                None => {
                    error!("Rolled back replica {} is gone from the repository", id);
                    self.account.free(allocated);
                    return;
                }
            }
            match records.remove(id) {
                Some(record) => record.to_entry(),
                None => return,
            }
        };

        self.delete_files(id);
        self.account.free(allocated);
        info!("Discarded incomplete replica {}", id);
        self.emit(&ReplicaEvent::Removed(entry));
    }

    fn close_read(&self, id: &PnfsId) {
        let now = SystemTime::now();
        let result = self.update(id, |record| {
            record.link_count = record.link_count.saturating_sub(1);
            record.last_accessed_at = now;
            Ok(())
        });
        if let Err(e) = result {
            error!("Failed to release link on {}: {}", id, e);
        }
    }

    /// Applies a mutation to one record and emits the resulting event.
    fn update<T, F>(&self, id: &PnfsId, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut ReplicaRecord) -> Result<T>,
    {
        let _serial = self.event_lock.lock().unwrap();
        let (value, event) = {
            let mut records = self.records.lock().unwrap();
            let record = records
                .get_mut(id)
                .ok_or_else(|| PoolError::FileNotInCache(id.to_string()))?;
            let before = record.clone();
            let value = mutate(record)?;
            let after = record.clone();
            self.account_for(Some(&before), Some(&after));
            if before != after {
                self.persist(&after);
            }
            (value, event_for(&before, &after))
        };
        if let Some(event) = event {
            self.emit(&event);
        }
        Ok(value)
    }

    fn account_for(&self, before: Option<&ReplicaRecord>, after: Option<&ReplicaRecord>) {
        let precious = |r: Option<&ReplicaRecord>| {
            r.filter(|r| r.state == ReplicaState::Precious)
                .map_or(0, |r| r.size as i64)
        };
        let removable = |r: Option<&ReplicaRecord>| {
            r.filter(|r| r.is_removable()).map_or(0, |r| r.size as i64)
        };
        let precious_delta = precious(after) - precious(before);
        let removable_delta = removable(after) - removable(before);
        if precious_delta != 0 {
            self.account.adjust_precious(precious_delta);
        }
        if removable_delta != 0 {
            self.account.adjust_removable(removable_delta);
        }
    }

    fn persist(&self, record: &ReplicaRecord) {
        if let Err(e) = self.metadata.store(record) {
            error!("Failed to persist metadata of {}: {}", record.id, e);
        }
    }

    /// Deletes data and metadata. Failures are left for the next inventory.
    fn delete_files(&self, id: &PnfsId) {
        let path = self.data_file(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(
                "Failed to delete data file {:?}, left for the next inventory: {}",
                path, e
            ),
        }
        if let Err(e) = self.metadata.remove(id) {
            error!("Failed to delete metadata of {}: {}", id, e);
        }
    }

    fn emit(&self, event: &ReplicaEvent) {
        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners.iter() {
            listener.on_event(event);
        }
    }
}

/// Whether `new` keeps a sticky record alive at least as long as `old`.
fn extends(new: Option<SystemTime>, old: Option<SystemTime>) -> bool {
    match (new, old) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(new), Some(old)) => new > old,
    }
}

fn event_for(before: &ReplicaRecord, after: &ReplicaRecord) -> Option<ReplicaEvent> {
    if before.state != after.state {
        return match after.state {
            ReplicaState::Precious => Some(ReplicaEvent::Precious(after.to_entry())),
            ReplicaState::Cached => Some(ReplicaEvent::Cached(after.to_entry())),
            _ => None,
        };
    }
    if before.sticky != after.sticky {
        return Some(ReplicaEvent::Sticky(after.to_entry()));
    }
    if before.link_count != after.link_count
        || before.locked != after.locked
        || before.last_accessed_at != after.last_accessed_at
    {
        return Some(ReplicaEvent::Touched(after.to_entry()));
    }
    None
}

/// Write access to a replica in a receiving state.
pub struct ReplicaHandle {
    repository: Arc<ReplicaRepository>,
    attributes: FileAttributes,
    target: ReplicaState,
    sticky: Vec<StickyRecord>,
    allocated: u64,
    committed: bool,
}

impl ReplicaHandle {
    pub fn id(&self) -> &PnfsId {
        &self.attributes.id
    }

    pub fn file(&self) -> PathBuf {
        self.repository.data_file(&self.attributes.id)
    }

    pub fn attributes(&self) -> &FileAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut FileAttributes {
        &mut self.attributes
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Reserves pool space for data about to be written.
    pub async fn allocate(&mut self, size: u64) -> Result<()> {
        self.repository.allocate(size).await?;
        self.allocated += size;
        Ok(())
    }

    /// Completes the replica. On failure the handle is dropped and the
    /// replica destroyed.
    pub fn commit(mut self) -> Result<CacheEntry> {
        let mut allocated = self.allocated;
        let result = self.repository.commit_entry(
            &self.attributes,
            self.target,
            &self.sticky,
            &mut allocated,
        );
        self.allocated = allocated;
        if result.is_ok() {
            self.committed = true;
        }
        result
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        if !self.committed {
            self.repository
                .abort_entry(&self.attributes.id, self.allocated);
        }
    }
}

/// Read access to a complete replica. Holds a link until dropped.
pub struct ReadHandle {
    repository: Arc<ReplicaRepository>,
    entry: CacheEntry,
}

impl ReadHandle {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn file(&self) -> PathBuf {
        self.repository.data_file(&self.entry.id)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        self.repository.close_read(&self.entry.id);
    }
}
