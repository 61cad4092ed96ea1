//! Storage Class Container Module
//!
//! Owns every flush queue of the pool and keeps them in step with the
//! repository: precious replicas are queued under their `class@hsm` key and
//! dropped again once they turn cached or are removed. A replica belongs to at
//! most one queue.

use crate::replica_types::{CacheEntry, FlushEntry, PnfsId, ReplicaState};
use crate::repository::{ReplicaEvent, ReplicaListener};
use crate::storage_class::{StorageClassInfo, StorageClassKey, StorageClassSettings, StorageClassStatus};
use crate::{PoolError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub struct StorageClassContainer {
    classes: RwLock<BTreeMap<StorageClassKey, Arc<StorageClassInfo>>>,
    defaults: RwLock<StorageClassSettings>,
    /// Settings of explicitly defined classes, applied when their queue is created.
    defined: RwLock<HashMap<StorageClassKey, StorageClassSettings>>,
}

impl StorageClassContainer {
    pub fn new(defaults: StorageClassSettings) -> Self {
        Self {
            classes: RwLock::new(BTreeMap::new()),
            defaults: RwLock::new(defaults),
            defined: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_settings(&self) -> StorageClassSettings {
        *self.defaults.read().unwrap()
    }

    /// Changes the settings used for queues created from now on.
    pub fn set_default_settings(&self, settings: StorageClassSettings) {
        *self.defaults.write().unwrap() = settings;
    }

    /// Defines a class with its own thresholds, creating its queue if needed.
    pub fn define(&self, key: StorageClassKey, settings: StorageClassSettings) -> Arc<StorageClassInfo> {
        self.defined.write().unwrap().insert(key.clone(), settings);
        let mut classes = self.classes.write().unwrap();
        let info = classes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(StorageClassInfo::new(key.clone(), settings)));
        info.set_settings(settings);
        info!(
            "Defined storage class {}: pending={} max_bytes={} max_age={:?}",
            key, settings.pending_count, settings.max_bytes, settings.max_age
        );
        Arc::clone(info)
    }

    /// Removes an empty, idle queue.
    pub fn remove_class(&self, key: &StorageClassKey) -> Result<()> {
        let mut classes = self.classes.write().unwrap();
        match classes.get(key) {
            None => Err(PoolError::InvalidRequest(format!("No such storage class: {}", key))),
            Some(info) if !info.is_empty() || info.is_active() => Err(PoolError::InvalidRequest(
                format!("Storage class {} is not empty", key),
            )),
            Some(_) => {
                classes.remove(key);
                self.defined.write().unwrap().remove(key);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &StorageClassKey) -> Option<Arc<StorageClassInfo>> {
        self.classes.read().unwrap().get(key).cloned()
    }

    /// All queues, in key order.
    pub fn classes(&self) -> Vec<Arc<StorageClassInfo>> {
        self.classes.read().unwrap().values().cloned().collect()
    }

    pub fn status(&self) -> Vec<StorageClassStatus> {
        self.classes().iter().map(|info| info.status()).collect()
    }

    pub fn suspend(&self, key: &StorageClassKey, suspended: bool) -> Result<()> {
        let info = self
            .get(key)
            .ok_or_else(|| PoolError::InvalidRequest(format!("No such storage class: {}", key)))?;
        info.set_suspended(suspended);
        Ok(())
    }

    /// The queue holding `id`, if any.
    pub fn find(&self, id: &PnfsId) -> Option<Arc<StorageClassInfo>> {
        self.classes
            .read()
            .unwrap()
            .values()
            .find(|info| info.contains(id))
            .cloned()
    }

    /// Queues a precious replica. A replica already queued is left where it is.
    pub fn add_entry(&self, entry: &CacheEntry) -> Result<()> {
        if self.find(&entry.id).is_some() {
            return Ok(());
        }
        let key = StorageClassKey::of(&entry.storage_info);
        let info = {
            let mut classes = self.classes.write().unwrap();
            let info = classes.entry(key.clone()).or_insert_with(|| {
                let settings = self
                    .defined
                    .read()
                    .unwrap()
                    .get(&key)
                    .copied()
                    .unwrap_or_else(|| *self.defaults.read().unwrap());
                debug!("Created flush queue {}", key);
                Arc::new(StorageClassInfo::new(key.clone(), settings))
            });
            Arc::clone(info)
        };
        info.add_request(FlushEntry::from(entry))
    }

    /// Drops a replica from whichever queue holds it.
    pub fn remove_entry(&self, id: &PnfsId) -> bool {
        match self.find(id) {
            Some(info) => info.remove_request(id).is_some(),
            None => false,
        }
    }

    /// Re-activates the failed requests of every queue.
    pub fn activate_all(&self) -> usize {
        self.classes().iter().map(|info| info.activate_all()).sum()
    }

    /// Number of queued replicas, failed ones included.
    pub fn request_count(&self) -> usize {
        self.classes()
            .iter()
            .map(|info| info.request_count() + info.failed_count())
            .sum()
    }
}

impl ReplicaListener for StorageClassContainer {
    fn on_event(&self, event: &ReplicaEvent) {
        match event {
            ReplicaEvent::Precious(entry) => {
                if let Err(e) = self.add_entry(entry) {
                    warn!("Failed to queue {} for flush: {}", entry.id, e);
                }
            }
            ReplicaEvent::Scanned(entry) if entry.state == ReplicaState::Precious => {
                if let Err(e) = self.add_entry(entry) {
                    warn!("Failed to queue {} for flush: {}", entry.id, e);
                }
            }
            ReplicaEvent::Cached(entry) | ReplicaEvent::Removed(entry) => {
                self.remove_entry(&entry.id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica_types::StorageInfo;
    use std::time::{Duration, SystemTime};

    fn entry(id: &str, state: ReplicaState, class: &str) -> CacheEntry {
        CacheEntry {
            id: PnfsId::new(id).unwrap(),
            state,
            size: 100,
            created_at: SystemTime::now(),
            last_accessed_at: SystemTime::now(),
            link_count: 0,
            sticky: Vec::new(),
            locked: false,
            storage_info: StorageInfo::new("osm", class),
        }
    }

    #[test]
    fn test_precious_replicas_are_routed_by_class() {
        let container = StorageClassContainer::new(StorageClassSettings::default());
        container.on_event(&ReplicaEvent::Precious(entry("01", ReplicaState::Precious, "raw")));
        container.on_event(&ReplicaEvent::Precious(entry("02", ReplicaState::Precious, "dst")));
        container.on_event(&ReplicaEvent::Scanned(entry("03", ReplicaState::Precious, "raw")));
        container.on_event(&ReplicaEvent::Scanned(entry("04", ReplicaState::Cached, "raw")));

        let raw = container.get(&StorageClassKey::new("osm", "raw")).unwrap();
        assert_eq!(raw.request_count(), 2);
        assert_eq!(raw.total_size(), 200);
        assert_eq!(container.classes().len(), 2);
        assert_eq!(container.request_count(), 3);
    }

    #[test]
    fn test_cached_and_removed_replicas_leave_their_queue() {
        let container = StorageClassContainer::new(StorageClassSettings::default());
        container.on_event(&ReplicaEvent::Precious(entry("01", ReplicaState::Precious, "raw")));
        container.on_event(&ReplicaEvent::Precious(entry("02", ReplicaState::Precious, "raw")));

        container.on_event(&ReplicaEvent::Cached(entry("01", ReplicaState::Cached, "raw")));
        container.on_event(&ReplicaEvent::Removed(entry("02", ReplicaState::Precious, "raw")));
        assert_eq!(container.request_count(), 0);
        assert!(container.find(&PnfsId::new("01").unwrap()).is_none());
    }

    #[test]
    fn test_replica_is_queued_once() {
        let container = StorageClassContainer::new(StorageClassSettings::default());
        let e = entry("01", ReplicaState::Precious, "raw");
        container.add_entry(&e).unwrap();
        container.add_entry(&e).unwrap();
        assert_eq!(container.request_count(), 1);
    }

    #[test]
    fn test_defined_settings_apply_to_new_queue() {
        let container = StorageClassContainer::new(StorageClassSettings::default());
        let key = StorageClassKey::new("osm", "raw");
        let settings = StorageClassSettings {
            pending_count: 2,
            max_bytes: 0,
            max_age: Duration::from_secs(3600),
        };
        container.define(key.clone(), settings);

        container.on_event(&ReplicaEvent::Precious(entry("01", ReplicaState::Precious, "raw")));
        container.on_event(&ReplicaEvent::Precious(entry("02", ReplicaState::Precious, "raw")));
        let info = container.get(&key).unwrap();
        assert_eq!(info.settings(), settings);
        assert!(info.is_triggered());

        assert!(container.remove_class(&key).is_err());
        container.remove_entry(&PnfsId::new("01").unwrap());
        container.remove_entry(&PnfsId::new("02").unwrap());
        container.remove_class(&key).unwrap();
        assert!(container.get(&key).is_none());
    }

    #[test]
    fn test_suspend_unknown_class_fails() {
        let container = StorageClassContainer::new(StorageClassSettings::default());
        assert!(container
            .suspend(&StorageClassKey::new("osm", "nope"), true)
            .is_err());
    }
}
