//! HSM Set Module
//!
//! The HSM instances this pool can talk to. Each instance has a type (the URI
//! scheme of its locations), a script that performs transfers, and free-form
//! attributes handed to the script as `-key=value` options.

use crate::replica_types::{FileAttributes, StorageInfo};
use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::RwLock;
use tracing::debug;

/// Transfer direction as passed to the HSM script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Get,
    Put,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Get => f.write_str("get"),
            Direction::Put => f.write_str("put"),
        }
    }
}

/// One HSM instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmDefinition {
    pub instance: String,
    #[serde(rename = "type")]
    pub hsm_type: String,
    pub command: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl HsmDefinition {
    pub fn new(instance: &str, hsm_type: &str, command: &str) -> Self {
        Self {
            instance: instance.to_string(),
            hsm_type: hsm_type.to_string(),
            command: command.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    /// `<command> <get|put> <id> <path> -si=<info> [-key[=value]]... [-uri=<location>]...`
    ///
    /// Only locations that belong to this instance are passed as `-uri`.
    pub fn command_line(&self, direction: Direction, attributes: &FileAttributes, path: &Path) -> String {
        let mut line = format!(
            "{} {} {} {} -si={}",
            self.command,
            direction,
            attributes.id,
            path.display(),
            attributes.storage_info_string()
        );
        for (key, value) in &self.attributes {
            if value.is_empty() {
                line.push_str(&format!(" -{}", key));
            } else {
                line.push_str(&format!(" -{}={}", key, value));
            }
        }
        for location in &attributes.storage_info.locations {
            if let Ok(parsed) = HsmLocation::parse(location) {
                if parsed.scheme == self.hsm_type && parsed.authority == self.instance {
                    line.push_str(&format!(" -uri={}", location));
                }
            }
        }
        debug!("HSM command: {}", line);
        line
    }
}

/// A parsed `scheme://authority/path?query` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmLocation {
    pub scheme: String,
    pub authority: String,
    pub rest: String,
}

impl HsmLocation {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, remainder) = uri
            .split_once("://")
            .ok_or_else(|| PoolError::ProtocolError(format!("Not an HSM location: {:?}", uri)))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(PoolError::ProtocolError(format!(
                "Invalid scheme in HSM location {:?}",
                uri
            )));
        }
        let split = remainder.find(['/', '?']).unwrap_or(remainder.len());
        let (authority, rest) = remainder.split_at(split);
        if authority.is_empty() {
            return Err(PoolError::ProtocolError(format!(
                "HSM location {:?} has no instance",
                uri
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            rest: rest.to_string(),
        })
    }

    /// Parses a location reported by an HSM of type `hsm_type`.
    pub fn validate(uri: &str, hsm_type: &str) -> Result<Self> {
        let location = Self::parse(uri)?;
        if location.scheme != hsm_type {
            return Err(PoolError::ProtocolError(format!(
                "HSM location {:?} does not belong to HSM type {}",
                uri, hsm_type
            )));
        }
        Ok(location)
    }
}

/// All HSM instances known to the pool, by instance name.
#[derive(Default)]
pub struct HsmSet {
    instances: RwLock<BTreeMap<String, HsmDefinition>>,
}

impl HsmSet {
    pub fn new(definitions: Vec<HsmDefinition>) -> Self {
        let set = Self::default();
        for definition in definitions {
            set.add(definition);
        }
        set
    }

    /// Adds or replaces an instance.
    pub fn add(&self, definition: HsmDefinition) {
        self.instances
            .write()
            .unwrap()
            .insert(definition.instance.clone(), definition);
    }

    pub fn remove(&self, instance: &str) -> Option<HsmDefinition> {
        self.instances.write().unwrap().remove(instance)
    }

    pub fn get(&self, instance: &str) -> Option<HsmDefinition> {
        self.instances.read().unwrap().get(instance).cloned()
    }

    pub fn instances(&self) -> Vec<HsmDefinition> {
        self.instances.read().unwrap().values().cloned().collect()
    }

    /// First instance of the given type, in instance name order.
    pub fn first_by_type(&self, hsm_type: &str) -> Option<HsmDefinition> {
        self.instances
            .read()
            .unwrap()
            .values()
            .find(|d| d.hsm_type == hsm_type)
            .cloned()
    }

    /// The instance a file can be restored from.
    ///
    /// A file without locations is looked up by its HSM type name as an
    /// instance name. Otherwise the first location whose authority is a known
    /// instance wins.
    pub fn find_accessible_instance(&self, storage_info: &StorageInfo) -> Option<HsmDefinition> {
        let instances = self.instances.read().unwrap();
        if storage_info.locations.is_empty() {
            return instances.get(&storage_info.hsm_type).cloned();
        }
        storage_info
            .locations
            .iter()
            .filter_map(|l| HsmLocation::parse(l).ok())
            .find_map(|l| instances.get(&l.authority).cloned())
    }
}
