//! Replica Metadata Store
//!
//! Durable per-replica metadata. The file backed store keeps one JSON document
//! per replica under `<pool>/meta/`, written atomically via a temp file and a
//! rename. The memory store is used by volatile pools and tests.

use crate::replica_types::{CacheEntry, PnfsId, ReplicaState, StickyRecord, StorageInfo};
use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

const META_EXTENSION: &str = "json";

/// Authoritative record of one replica.
///
/// Link count and protection flag only live as long as the process and are
/// not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub id: PnfsId,
    pub state: ReplicaState,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_accessed_at: SystemTime,
    #[serde(default)]
    pub sticky: Vec<StickyRecord>,
    pub storage_info: StorageInfo,
    #[serde(skip)]
    pub link_count: u32,
    #[serde(skip)]
    pub locked: bool,
}

impl ReplicaRecord {
    pub fn new(id: PnfsId, state: ReplicaState, storage_info: StorageInfo) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            state,
            size: 0,
            created_at: now,
            last_accessed_at: now,
            sticky: Vec::new(),
            storage_info,
            link_count: 0,
            locked: false,
        }
    }

    pub fn is_removable(&self) -> bool {
        self.state == ReplicaState::Cached
            && self.sticky.is_empty()
            && self.link_count == 0
            && !self.locked
    }

    pub fn to_entry(&self) -> CacheEntry {
        CacheEntry {
            id: self.id.clone(),
            state: self.state,
            size: self.size,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            link_count: self.link_count,
            sticky: self.sticky.clone(),
            locked: self.locked,
            storage_info: self.storage_info.clone(),
        }
    }
}

/// Backing store for replica metadata.
pub trait MetaDataStore: Send + Sync {
    /// All records currently persisted.
    fn list(&self) -> Result<Vec<ReplicaRecord>>;

    fn store(&self, record: &ReplicaRecord) -> Result<()>;

    /// Removing an unknown id is not an error.
    fn remove(&self, id: &PnfsId) -> Result<()>;
}

/// One JSON document per replica.
pub struct FileMetaDataStore {
    dir: PathBuf,
}

impl FileMetaDataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            PoolError::IoError(format!(
                "Failed to create metadata directory {:?}: {}",
                dir, e
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: &PnfsId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, META_EXTENSION))
    }
}

impl MetaDataStore for FileMetaDataStore {
    fn list(&self) -> Result<Vec<ReplicaRecord>> {
        let mut records = Vec::new();
        for entry in walkdir::WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed to read replica metadata {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_str::<ReplicaRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Ignoring corrupt replica metadata {:?}: {}", path, e),
            }
        }
        debug!("Read {} replica metadata records from {:?}", records.len(), self.dir);
        Ok(records)
    }

    fn store(&self, record: &ReplicaRecord) -> Result<()> {
        let path = self.path_of(&record.id);
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;

        std::fs::write(&temp_path, json).map_err(|e| {
            PoolError::IoError(format!("Failed to write replica metadata: {}", e))
        })?;
        std::fs::rename(&temp_path, &path).map_err(|e| {
            PoolError::IoError(format!("Failed to rename replica metadata: {}", e))
        })?;
        Ok(())
    }

    fn remove(&self, id: &PnfsId) -> Result<()> {
        match std::fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::IoError(format!(
                "Failed to remove replica metadata for {}: {}",
                id, e
            ))),
        }
    }
}

/// In-memory metadata, lost on restart.
#[derive(Default)]
pub struct MemoryMetaDataStore {
    records: Mutex<HashMap<PnfsId, ReplicaRecord>>,
}

impl MemoryMetaDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaDataStore for MemoryMetaDataStore {
    fn list(&self) -> Result<Vec<ReplicaRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    fn store(&self, record: &ReplicaRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &PnfsId) -> Result<()> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> ReplicaRecord {
        let mut record = ReplicaRecord::new(
            PnfsId::new(id).unwrap(),
            ReplicaState::Precious,
            StorageInfo::new("osm", "raw"),
        );
        record.size = 123;
        record.link_count = 2;
        record.locked = true;
        record
    }

    #[test]
    fn test_file_store_persists_records_without_runtime_fields() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaDataStore::new(temp_dir.path().join("meta")).unwrap();

        store.store(&record("0001")).unwrap();
        store.store(&record("0002")).unwrap();

        let mut records = store.list().unwrap();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].size, 123);
        assert_eq!(records[0].link_count, 0);
        assert!(!records[0].locked);
    }

    #[test]
    fn test_file_store_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaDataStore::new(temp_dir.path()).unwrap();
        let r = record("0001");
        store.store(&r).unwrap();
        store.remove(&r.id).unwrap();
        store.remove(&r.id).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_skips_corrupt_documents() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetaDataStore::new(temp_dir.path()).unwrap();
        std::fs::write(temp_dir.path().join("00FF.json"), "{not json").unwrap();
        store.store(&record("0001")).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryMetaDataStore::new();
        let r = record("0A");
        store.store(&r).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        store.remove(&r.id).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
