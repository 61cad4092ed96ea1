//! Name Space Module
//!
//! The metadata service the pool reports to. The pool only needs four
//! operations from it; [`JsonNameSpace`] keeps one JSON document per file in a
//! directory and [`MemoryNameSpace`] keeps everything in process.

use crate::replica_types::{FileAttributes, PnfsId};
use crate::{PoolError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Metadata service consumed by the pool.
pub trait NameSpace: Send + Sync {
    /// Attributes of a file, or `FileNotFound`.
    fn get_storage_info<'a>(&'a self, id: &'a PnfsId) -> BoxFuture<'a, Result<FileAttributes>>;

    fn set_file_size<'a>(&'a self, id: &'a PnfsId, size: u64) -> BoxFuture<'a, Result<()>>;

    /// Records the HSM locations of a flushed file.
    ///
    /// Fails with `FileNotFound` if the file was deleted, or with a transient
    /// error if the service could not be reached.
    fn record_flush_location<'a>(
        &'a self,
        id: &'a PnfsId,
        attributes: &'a FileAttributes,
    ) -> BoxFuture<'a, Result<()>>;

    fn file_exists<'a>(&'a self, id: &'a PnfsId) -> BoxFuture<'a, Result<bool>>;
}

/// In-process name space.
#[derive(Default)]
pub struct MemoryNameSpace {
    files: Mutex<HashMap<PnfsId, FileAttributes>>,
    /// Number of upcoming flush notifications that fail with a transient error.
    failing_notifications: Mutex<u32>,
    notifications: Mutex<u32>,
}

impl MemoryNameSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, attributes: FileAttributes) {
        self.files
            .lock()
            .unwrap()
            .insert(attributes.id.clone(), attributes);
    }

    pub fn remove(&self, id: &PnfsId) -> Option<FileAttributes> {
        self.files.lock().unwrap().remove(id)
    }

    pub fn get(&self, id: &PnfsId) -> Option<FileAttributes> {
        self.files.lock().unwrap().get(id).cloned()
    }

    /// Makes the next `count` flush notifications fail as if the service was down.
    pub fn fail_next_notifications(&self, count: u32) {
        *self.failing_notifications.lock().unwrap() = count;
    }

    /// Number of flush notifications received, failed ones included.
    pub fn notification_count(&self) -> u32 {
        *self.notifications.lock().unwrap()
    }

    fn apply_flush_location(&self, id: &PnfsId, attributes: &FileAttributes) -> Result<()> {
        *self.notifications.lock().unwrap() += 1;
        {
            let mut failing = self.failing_notifications.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(PoolError::NameSpaceError(
                    "name space temporarily unavailable".to_string(),
                ));
            }
        }
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(id)
            .ok_or_else(|| PoolError::FileNotFound(id.to_string()))?;
        for location in &attributes.storage_info.locations {
            file.storage_info.add_location(location);
        }
        for checksum in &attributes.storage_info.checksums {
            file.storage_info.add_checksum(checksum);
        }
        Ok(())
    }
}

impl NameSpace for MemoryNameSpace {
    fn get_storage_info<'a>(&'a self, id: &'a PnfsId) -> BoxFuture<'a, Result<FileAttributes>> {
        let result = self
            .get(id)
            .ok_or_else(|| PoolError::FileNotFound(id.to_string()));
        async move { result }.boxed()
    }

    fn set_file_size<'a>(&'a self, id: &'a PnfsId, size: u64) -> BoxFuture<'a, Result<()>> {
        let result = match self.files.lock().unwrap().get_mut(id) {
            Some(attributes) => {
                attributes.size = size;
                Ok(())
            }
            None => Err(PoolError::FileNotFound(id.to_string())),
        };
        async move { result }.boxed()
    }

    fn record_flush_location<'a>(
        &'a self,
        id: &'a PnfsId,
        attributes: &'a FileAttributes,
    ) -> BoxFuture<'a, Result<()>> {
        let result = self.apply_flush_location(id, attributes);
        async move { result }.boxed()
    }

    fn file_exists<'a>(&'a self, id: &'a PnfsId) -> BoxFuture<'a, Result<bool>> {
        let exists = self.files.lock().unwrap().contains_key(id);
        async move { Ok(exists) }.boxed()
    }
}

/// Name space backed by a directory of `<id>.json` documents.
pub struct JsonNameSpace {
    dir: PathBuf,
}

impl JsonNameSpace {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            PoolError::NameSpaceError(format!(
                "Failed to create name space directory {:?}: {}",
                dir, e
            ))
        })?;
        Ok(Self { dir })
    }

    fn path_of(&self, id: &PnfsId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read(&self, id: &PnfsId) -> Result<FileAttributes> {
        let path = self.path_of(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PoolError::FileNotFound(id.to_string()))
            }
            Err(e) => {
                return Err(PoolError::NameSpaceError(format!(
                    "Failed to read {:?}: {}",
                    path, e
                )))
            }
        };
        serde_json::from_str(&content).map_err(|e| {
            PoolError::NameSpaceError(format!("Corrupt name space entry {:?}: {}", path, e))
        })
    }

    /// Creates or replaces the entry of a file.
    pub async fn register_file(&self, attributes: &FileAttributes) -> Result<()> {
        let path = self.path_of(&attributes.id);
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(attributes)?;
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| PoolError::NameSpaceError(format!("Failed to write {:?}: {}", temp_path, e)))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| PoolError::NameSpaceError(format!("Failed to rename {:?}: {}", path, e)))?;
        Ok(())
    }
}

impl NameSpace for JsonNameSpace {
    fn get_storage_info<'a>(&'a self, id: &'a PnfsId) -> BoxFuture<'a, Result<FileAttributes>> {
        self.read(id).boxed()
    }

    fn set_file_size<'a>(&'a self, id: &'a PnfsId, size: u64) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut attributes = self.read(id).await?;
            attributes.size = size;
            self.register_file(&attributes).await
        }
        .boxed()
    }

    fn record_flush_location<'a>(
        &'a self,
        id: &'a PnfsId,
        attributes: &'a FileAttributes,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut current = self.read(id).await?;
            for location in &attributes.storage_info.locations {
                current.storage_info.add_location(location);
            }
            for checksum in &attributes.storage_info.checksums {
                current.storage_info.add_checksum(checksum);
            }
            self.register_file(&current).await?;
            debug!("Recorded {} HSM locations for {}", current.storage_info.locations.len(), id);
            Ok(())
        }
        .boxed()
    }

    fn file_exists<'a>(&'a self, id: &'a PnfsId) -> BoxFuture<'a, Result<bool>> {
        async move { Ok(tokio::fs::try_exists(self.path_of(id)).await?) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica_types::StorageInfo;
    use tempfile::TempDir;

    fn attrs(id: &str) -> FileAttributes {
        FileAttributes::new(PnfsId::new(id).unwrap(), 10, StorageInfo::new("osm", "raw"))
    }

    #[tokio::test]
    async fn test_memory_name_space_records_locations() {
        let ns = MemoryNameSpace::new();
        let a = attrs("01");
        ns.insert(a.clone());

        let mut flushed = a.clone();
        flushed.storage_info.add_location("osm://osm/?bfid=1");
        ns.record_flush_location(&a.id, &flushed).await.unwrap();

        assert_eq!(ns.get(&a.id).unwrap().storage_info.locations.len(), 1);
        assert_eq!(ns.notification_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_name_space_failure_injection() {
        let ns = MemoryNameSpace::new();
        let a = attrs("01");
        ns.insert(a.clone());
        ns.fail_next_notifications(1);

        let first = ns.record_flush_location(&a.id, &a).await;
        assert!(matches!(first, Err(PoolError::NameSpaceError(_))));
        assert!(ns.record_flush_location(&a.id, &a).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_name_space_not_found() {
        let ns = MemoryNameSpace::new();
        let a = attrs("02");
        let err = ns.record_flush_location(&a.id, &a).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!ns.file_exists(&a.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_json_name_space_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let ns = JsonNameSpace::new(temp_dir.path()).unwrap();
        let a = attrs("0A");

        assert!(ns.get_storage_info(&a.id).await.unwrap_err().is_not_found());
        ns.register_file(&a).await.unwrap();
        assert!(ns.file_exists(&a.id).await.unwrap());

        ns.set_file_size(&a.id, 99).await.unwrap();
        let mut flushed = a.clone();
        flushed.storage_info.add_location("osm://osm/?bfid=7");
        ns.record_flush_location(&a.id, &flushed).await.unwrap();

        let stored = ns.get_storage_info(&a.id).await.unwrap();
        assert_eq!(stored.size, 99);
        assert_eq!(stored.storage_info.locations, vec!["osm://osm/?bfid=7"]);
    }
}
