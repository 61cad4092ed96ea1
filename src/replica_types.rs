//! Replica Types Module
//!
//! Basic data structures shared by the replica store, the sweeper, the flush
//! queues and the storage handler.

use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Maximum number of hex digits accepted in a file id.
const MAX_PNFSID_LEN: usize = 64;

/// Immutable, globally unique file identifier.
///
/// Ids are hex strings and are normalised to upper case so that two spellings
/// of the same id compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PnfsId(String);

impl PnfsId {
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() || id.len() > MAX_PNFSID_LEN {
            return Err(PoolError::InvalidRequest(format!(
                "Invalid file id length: {:?}",
                id
            )));
        }
        if !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PoolError::InvalidRequest(format!(
                "File id must be hexadecimal: {:?}",
                id
            )));
        }
        Ok(Self(id.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PnfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PnfsId {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        PnfsId::new(s)
    }
}

impl TryFrom<String> for PnfsId {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self> {
        PnfsId::new(&value)
    }
}

impl From<PnfsId> for String {
    fn from(id: PnfsId) -> Self {
        id.0
    }
}

/// State of a replica. The four states are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    /// Being written by a client.
    ReceivingFromClient,
    /// Being restored from the HSM.
    ReceivingFromStore,
    /// Complete, but no copy on the HSM yet.
    Precious,
    /// Safe to delete.
    Cached,
}

impl ReplicaState {
    pub fn is_receiving(&self) -> bool {
        matches!(
            self,
            ReplicaState::ReceivingFromClient | ReplicaState::ReceivingFromStore
        )
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaState::ReceivingFromClient => "FROM_CLIENT",
            ReplicaState::ReceivingFromStore => "FROM_STORE",
            ReplicaState::Precious => "PRECIOUS",
            ReplicaState::Cached => "CACHED",
        };
        f.write_str(name)
    }
}

/// A pin that keeps a replica on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    /// `None` pins the replica until the owner removes the record.
    pub expires_at: Option<SystemTime>,
}

impl StickyRecord {
    pub fn new(owner: &str, expires_at: Option<SystemTime>) -> Self {
        Self {
            owner: owner.to_string(),
            expires_at,
        }
    }

    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            None => true,
            Some(expiry) => expiry > now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLatency {
    Online,
    #[default]
    Nearline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionPolicy {
    #[default]
    Custodial,
    Replica,
    Output,
}

impl fmt::Display for AccessLatency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLatency::Online => f.write_str("ONLINE"),
            AccessLatency::Nearline => f.write_str("NEARLINE"),
        }
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Custodial => f.write_str("CUSTODIAL"),
            RetentionPolicy::Replica => f.write_str("REPLICA"),
            RetentionPolicy::Output => f.write_str("OUTPUT"),
        }
    }
}

/// HSM related metadata of a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    /// HSM type, e.g. `osm` or `enstore`.
    pub hsm_type: String,
    pub storage_class: String,
    /// HSM locations of the file, as `type://instance/...` URIs.
    #[serde(default)]
    pub locations: Vec<String>,
    /// Checksums as `type:value`.
    #[serde(default)]
    pub checksums: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub access_latency: AccessLatency,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

impl StorageInfo {
    pub fn new(hsm_type: &str, storage_class: &str) -> Self {
        Self {
            hsm_type: hsm_type.to_string(),
            storage_class: storage_class.to_string(),
            ..Default::default()
        }
    }

    /// Flush queue key of this file, `class@hsm`.
    pub fn storage_class_key(&self) -> String {
        format!("{}@{}", self.storage_class, self.hsm_type)
    }

    pub fn is_stored(&self) -> bool {
        !self.locations.is_empty()
    }

    /// Adds a location unless already known. Returns whether it was added.
    pub fn add_location(&mut self, location: &str) -> bool {
        if self.locations.iter().any(|l| l == location) {
            return false;
        }
        self.locations.push(location.to_string());
        true
    }

    pub fn add_checksum(&mut self, checksum: &str) -> bool {
        if self.checksums.iter().any(|c| c == checksum) {
            return false;
        }
        self.checksums.push(checksum.to_string());
        true
    }
}

/// Everything the name space knows about a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub id: PnfsId,
    pub size: u64,
    pub storage_info: StorageInfo,
}

impl FileAttributes {
    pub fn new(id: PnfsId, size: u64, storage_info: StorageInfo) -> Self {
        Self {
            id,
            size,
            storage_info,
        }
    }

    /// Compact `key=value;` rendering handed to HSM scripts as `-si=`.
    pub fn storage_info_string(&self) -> String {
        let info = &self.storage_info;
        format!(
            "size={};new={};stored={};sClass={};hsm={};accessLatency={};retentionPolicy={};",
            self.size,
            !info.is_stored(),
            info.is_stored(),
            info.storage_class,
            info.hsm_type,
            info.access_latency,
            info.retention_policy,
        )
    }
}

/// Point-in-time view of a replica, as handed to listeners and callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: PnfsId,
    pub state: ReplicaState,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_accessed_at: SystemTime,
    pub link_count: u32,
    pub sticky: Vec<StickyRecord>,
    /// Protection flag held by long running operations such as a flush.
    pub locked: bool,
    pub storage_info: StorageInfo,
}

impl CacheEntry {
    pub fn is_sticky(&self) -> bool {
        !self.sticky.is_empty()
    }

    /// Whether the sweeper may delete this replica right now.
    pub fn is_removable(&self) -> bool {
        self.state == ReplicaState::Cached
            && !self.is_sticky()
            && self.link_count == 0
            && !self.locked
    }

    pub fn file_attributes(&self) -> FileAttributes {
        FileAttributes::new(self.id.clone(), self.size, self.storage_info.clone())
    }
}

/// A replica waiting in a flush queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushEntry {
    pub id: PnfsId,
    pub created_at: SystemTime,
    pub size: u64,
}

impl From<&CacheEntry> for FlushEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            id: entry.id.clone(),
            created_at: entry.created_at,
            size: entry.size,
        }
    }
}
