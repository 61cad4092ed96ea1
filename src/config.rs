//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! The YAML file is read first, then environment variables and finally command-line
//! arguments override individual settings.

use crate::flush_controller::FlushSettings;
use crate::hsm_set::HsmDefinition;
use crate::storage_class::{StorageClassKey, StorageClassSettings};
use crate::storage_handler::StorageHandlerSettings;
use crate::sweeper::SweeperKind;
use crate::{PoolError, Result};
use clap::{Arg, ArgAction, Command};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(super) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "d" | "day" | "days" => Duration::from_secs_f64(value * 86400.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Byte sizes given as a plain number or with a binary suffix: "512", "10k", "5M", "2G", "1T"
pub(crate) mod bytes_serde {
    use serde::de::{self, Visitor};
    use serde::Deserializer;
    use std::fmt;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(BytesVisitor)
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer).map(Some)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a byte count such as 1024 or \"5G\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("Negative size: {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            parse_bytes(v).map_err(E::custom)
        }
    }

    pub(crate) fn parse_bytes(s: &str) -> Result<u64, String> {
        let s = s.trim();
        let num_end = s
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("No number found in size string: {}", s));
        }

        let value: u64 = s[..num_end]
            .parse()
            .map_err(|e| format!("Failed to parse size '{}': {}", s, e))?;
        let shift = match s[num_end..].trim() {
            "" | "b" | "B" => 0,
            "k" | "K" | "KB" | "KiB" => 10,
            "m" | "M" | "MB" | "MiB" => 20,
            "g" | "G" | "GB" | "GiB" => 30,
            "t" | "T" | "TB" | "TiB" => 40,
            unit => return Err(format!("Unknown size unit: {}", unit)),
        };
        value
            .checked_mul(1u64 << shift)
            .ok_or_else(|| format!("Size out of range: {}", s))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub storage_handler: StorageHandlerConfig,
    #[serde(default)]
    pub storage_classes: StorageClassesConfig,
    #[serde(default)]
    pub hsms: Vec<HsmDefinition>,
    #[serde(default)]
    pub namespace: NameSpaceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_name")]
    pub name: String,
    /// Holds `data/`, `meta/` and the pool lock file.
    #[serde(default = "default_base_dir", deserialize_with = "pathbuf_serde::deserialize")]
    pub base_dir: PathBuf,
    #[serde(default = "default_total_space", deserialize_with = "bytes_serde::deserialize")]
    pub total_space: u64,
    /// Defaults to a quarter of the pool, at most 4 GiB.
    #[serde(default, deserialize_with = "bytes_serde::deserialize_option")]
    pub gap: Option<u64>,
    /// A volatile pool never keeps precious replicas.
    #[serde(default)]
    pub volatile: bool,
    #[serde(default = "default_true")]
    pub sticky_allowed: bool,
    /// Allocations wait for the sweeper instead of failing when the pool is full.
    #[serde(default = "default_true")]
    pub allocation_blocking: bool,
    #[serde(default = "default_audit_interval", deserialize_with = "duration_serde::deserialize")]
    pub audit_interval: Duration,
    #[serde(default = "default_shutdown_timeout", deserialize_with = "duration_serde::deserialize")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default)]
    pub kind: SweeperKind,
    #[serde(default = "default_pass_delay", deserialize_with = "duration_serde::deserialize")]
    pub pass_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    #[serde(default = "default_flush_interval", deserialize_with = "duration_serde::deserialize")]
    pub interval: Duration,
    #[serde(default = "default_flush_max_active")]
    pub max_active: usize,
    #[serde(default = "default_retry_delay", deserialize_with = "duration_serde::deserialize")]
    pub retry_delay_on_error: Duration,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHandlerConfig {
    #[serde(default = "default_max_active_jobs")]
    pub max_active_fetch: usize,
    #[serde(default = "default_max_active_jobs")]
    pub max_active_store: usize,
    #[serde(default = "default_hsm_timeout", deserialize_with = "duration_serde::deserialize")]
    pub fetch_timeout: Duration,
    #[serde(default = "default_hsm_timeout", deserialize_with = "duration_serde::deserialize")]
    pub store_timeout: Duration,
    #[serde(default = "default_notify_retry_delay", deserialize_with = "duration_serde::deserialize")]
    pub notify_retry_delay: Duration,
    #[serde(default = "default_true")]
    pub check_namespace_before_store: bool,
    #[serde(default)]
    pub retain_online_custodial: bool,
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,
}

/// Flush thresholds of one storage class. Zero disables a count or size threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageClassConfig {
    #[serde(default)]
    pub pending_count: usize,
    #[serde(default, deserialize_with = "bytes_serde::deserialize")]
    pub max_bytes: u64,
    #[serde(default = "default_max_age", deserialize_with = "duration_serde::deserialize")]
    pub max_age: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageClassDefinition {
    /// `<class>@<hsm>`
    pub name: String,
    #[serde(default)]
    pub pending_count: usize,
    #[serde(default, deserialize_with = "bytes_serde::deserialize")]
    pub max_bytes: u64,
    #[serde(default = "default_max_age", deserialize_with = "duration_serde::deserialize")]
    pub max_age: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageClassesConfig {
    #[serde(default)]
    pub defaults: StorageClassConfig,
    #[serde(default)]
    pub classes: Vec<StorageClassDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameSpaceConfig {
    #[serde(default = "default_namespace_dir", deserialize_with = "pathbuf_serde::deserialize")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_app_log_dir", deserialize_with = "pathbuf_serde::deserialize")]
    pub app_log_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Days of log files to keep, 0 keeps everything.
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
}

fn default_true() -> bool {
    true
}

fn default_pool_name() -> String {
    "pool".to_string()
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/hsm-pool/pool")
}

fn default_total_space() -> u64 {
    100 * 1024 * 1024 * 1024 // 100GB
}

fn default_audit_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_pass_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_flush_max_active() -> usize {
    1000
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_active_jobs() -> usize {
    10
}

fn default_hsm_timeout() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_notify_retry_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_max_output_lines() -> usize {
    200
}

fn default_max_age() -> Duration {
    Duration::from_secs(60)
}

fn default_namespace_dir() -> PathBuf {
    PathBuf::from("/var/lib/hsm-pool/namespace")
}

fn default_app_log_dir() -> PathBuf {
    PathBuf::from("/var/log/hsm-pool")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_retention_days() -> u32 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            base_dir: default_base_dir(),
            total_space: default_total_space(),
            gap: None,
            volatile: false,
            sticky_allowed: true,
            allocation_blocking: true,
            audit_interval: default_audit_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            kind: SweeperKind::default(),
            pass_delay: default_pass_delay(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
            max_active: default_flush_max_active(),
            retry_delay_on_error: default_retry_delay(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Default for StorageHandlerConfig {
    fn default() -> Self {
        Self {
            max_active_fetch: default_max_active_jobs(),
            max_active_store: default_max_active_jobs(),
            fetch_timeout: default_hsm_timeout(),
            store_timeout: default_hsm_timeout(),
            notify_retry_delay: default_notify_retry_delay(),
            check_namespace_before_store: true,
            retain_online_custodial: false,
            max_output_lines: default_max_output_lines(),
        }
    }
}

impl Default for StorageClassConfig {
    fn default() -> Self {
        Self {
            pending_count: 0,
            max_bytes: 0,
            max_age: default_max_age(),
        }
    }
}

impl Default for NameSpaceConfig {
    fn default() -> Self {
        Self {
            dir: default_namespace_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_log_dir: default_app_log_dir(),
            log_level: default_log_level(),
            retention_days: default_log_retention_days(),
        }
    }
}

impl PoolConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.base_dir.join("meta")
    }

    pub fn gap(&self) -> u64 {
        self.gap
            .unwrap_or_else(|| crate::account::default_gap(self.total_space))
    }
}

impl StorageClassConfig {
    pub fn to_settings(&self) -> StorageClassSettings {
        StorageClassSettings {
            pending_count: self.pending_count,
            max_bytes: self.max_bytes,
            max_age: self.max_age,
        }
    }
}

impl StorageClassDefinition {
    pub fn key(&self) -> Result<StorageClassKey> {
        StorageClassKey::parse(&self.name)
    }

    pub fn to_settings(&self) -> StorageClassSettings {
        StorageClassSettings {
            pending_count: self.pending_count,
            max_bytes: self.max_bytes,
            max_age: self.max_age,
        }
    }
}

impl From<&FlushConfig> for FlushSettings {
    fn from(config: &FlushConfig) -> Self {
        Self {
            interval: config.interval,
            max_active: config.max_active,
            retry_delay_on_error: config.retry_delay_on_error,
            max_batch_size: config.max_batch_size,
        }
    }
}

impl From<&StorageHandlerConfig> for StorageHandlerSettings {
    fn from(config: &StorageHandlerConfig) -> Self {
        Self {
            max_active_fetch: config.max_active_fetch,
            max_active_store: config.max_active_store,
            fetch_timeout: config.fetch_timeout,
            store_timeout: config.store_timeout,
            notify_retry_delay: config.notify_retry_delay,
            check_namespace_before_store: config.check_namespace_before_store,
            retain_online_custodial: config.retain_online_custodial,
            max_output_lines: config.max_output_lines,
        }
    }
}

impl Config {
    /// Load configuration from file, environment variables, and command line arguments
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        // Override with environment variables
        config.apply_env_overrides();

        // Override with command line arguments
        config.apply_cli_overrides(&matches);

        config.validate()?;

        info!(
            "Configuration loaded: pool={} base_dir={:?} total_space={}",
            config.pool.name, config.pool.base_dir, config.pool.total_space
        );
        Ok(config)
    }

    fn build_cli() -> Command {
        Command::new("hsm-pool")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Disk cache pool in front of a tape-backed HSM")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("name")
                    .long("name")
                    .value_name("NAME")
                    .help("Pool name"),
            )
            .arg(
                Arg::new("base-dir")
                    .long("base-dir")
                    .value_name("DIR")
                    .help("Pool base directory"),
            )
            .arg(
                Arg::new("total-space")
                    .long("total-space")
                    .value_name("SIZE")
                    .help("Pool size, e.g. 500G"),
            )
            .arg(
                Arg::new("sweeper")
                    .long("sweeper")
                    .value_name("KIND")
                    .help("Sweeper: lru, nocache or none"),
            )
            .arg(
                Arg::new("namespace-dir")
                    .long("namespace-dir")
                    .value_name("DIR")
                    .help("Name space directory"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("volatile")
                    .long("volatile")
                    .action(ArgAction::SetTrue)
                    .help("Never keep precious replicas"),
            )
    }

    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config = Self::from_yaml(&content).map_err(|e| {
            PoolError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| PoolError::ConfigError(e.to_string()))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("POOL_NAME") {
            self.pool.name = name;
        }

        if let Ok(base_dir) = std::env::var("POOL_BASE_DIR") {
            self.pool.base_dir = pathbuf_serde::expand_tilde(&base_dir);
        }

        if let Ok(total) = std::env::var("POOL_TOTAL_SPACE") {
            match bytes_serde::parse_bytes(&total) {
                Ok(total) => self.pool.total_space = total,
                Err(e) => warn!("Ignoring POOL_TOTAL_SPACE: {}", e),
            }
        }

        if let Ok(dir) = std::env::var("NAMESPACE_DIR") {
            self.namespace.dir = pathbuf_serde::expand_tilde(&dir);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.log_level = level;
        }

        if let Ok(app_log_dir) = std::env::var("APP_LOG_DIR") {
            self.logging.app_log_dir = PathBuf::from(app_log_dir);
        }
    }

    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(name) = matches.get_one::<String>("name") {
            self.pool.name = name.clone();
        }

        if let Some(base_dir) = matches.get_one::<String>("base-dir") {
            self.pool.base_dir = pathbuf_serde::expand_tilde(base_dir);
        }

        if let Some(total) = matches.get_one::<String>("total-space") {
            match bytes_serde::parse_bytes(total) {
                Ok(total) => self.pool.total_space = total,
                Err(e) => warn!("Ignoring --total-space: {}", e),
            }
        }

        if let Some(kind) = matches.get_one::<String>("sweeper") {
            match kind.as_str() {
                "lru" => self.sweeper.kind = SweeperKind::Lru,
                "nocache" => self.sweeper.kind = SweeperKind::NoCache,
                "none" => self.sweeper.kind = SweeperKind::None,
                other => warn!("Ignoring unknown sweeper {}", other),
            }
        }

        if let Some(dir) = matches.get_one::<String>("namespace-dir") {
            self.namespace.dir = pathbuf_serde::expand_tilde(dir);
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        if matches.get_flag("volatile") {
            self.pool.volatile = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.name.trim().is_empty() {
            return Err(PoolError::ConfigError("Pool name must not be empty".to_string()));
        }
        if self.pool.total_space == 0 {
            return Err(PoolError::ConfigError("Pool total_space must be positive".to_string()));
        }
        if self.pool.gap() >= self.pool.total_space {
            return Err(PoolError::ConfigError(format!(
                "Pool gap {} must be smaller than total_space {}",
                self.pool.gap(),
                self.pool.total_space
            )));
        }
        if self.pool.audit_interval.is_zero() {
            return Err(PoolError::ConfigError("audit_interval must be positive".to_string()));
        }
        if self.flush.interval.is_zero() {
            return Err(PoolError::ConfigError("Flush interval must be positive".to_string()));
        }
        if self.flush.max_batch_size == 0 {
            return Err(PoolError::ConfigError("Flush max_batch_size must be positive".to_string()));
        }
        if self.storage_handler.max_output_lines == 0 {
            return Err(PoolError::ConfigError("max_output_lines must be positive".to_string()));
        }

        let mut instances = HashSet::new();
        for hsm in &self.hsms {
            if hsm.instance.is_empty() || hsm.hsm_type.is_empty() {
                return Err(PoolError::ConfigError(
                    "HSM instance and type must not be empty".to_string(),
                ));
            }
            if hsm.command.trim().is_empty() {
                return Err(PoolError::ConfigError(format!(
                    "HSM {} has no command",
                    hsm.instance
                )));
            }
            if !instances.insert(hsm.instance.as_str()) {
                return Err(PoolError::ConfigError(format!(
                    "Duplicate HSM instance {}",
                    hsm.instance
                )));
            }
        }

        let mut classes = HashSet::new();
        for class in &self.storage_classes.classes {
            let key = class
                .key()
                .map_err(|e| PoolError::ConfigError(format!("Bad storage class {}: {}", class.name, e)))?;
            if !classes.insert(key) {
                return Err(PoolError::ConfigError(format!(
                    "Duplicate storage class {}",
                    class.name
                )));
            }
        }

        if self.hsms.is_empty() {
            warn!("No HSM instances configured, fetch and store requests will fail");
        }
        debug!(
            "Configuration valid: {} HSM instances, {} storage classes",
            self.hsms.len(),
            self.storage_classes.classes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parsing_units() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("4h").unwrap(), Duration::from_secs(14400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("3 weeks").is_err());
    }

    #[test]
    fn test_size_parsing_units() {
        use bytes_serde::parse_bytes;
        assert_eq!(parse_bytes("512").unwrap(), 512);
        assert_eq!(parse_bytes("10k").unwrap(), 10 * 1024);
        assert_eq!(parse_bytes("5M").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_bytes("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("1T").unwrap(), 1024u64.pow(4));
        assert!(parse_bytes("G").is_err());
        assert!(parse_bytes("5X").is_err());
        assert!(parse_bytes("99999999999T").is_err());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
pool:
  name: "pool-a"
  base_dir: "/srv/pool-a"
  total_space: "2G"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.pool.name, "pool-a");
        assert_eq!(config.pool.total_space, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.pool.gap(), 512 * 1024 * 1024);
        assert!(config.pool.sticky_allowed);
        assert_eq!(config.pool.data_dir(), PathBuf::from("/srv/pool-a/data"));
        assert_eq!(config.sweeper.kind, SweeperKind::Lru);
        assert_eq!(config.flush.interval, Duration::from_secs(60));
        assert_eq!(config.storage_handler.notify_retry_delay, Duration::from_secs(120));
        assert!(config.hsms.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
pool:
  name: "pool-b"
  base_dir: "/srv/pool-b"
  total_space: 1073741824
  gap: "100M"
  volatile: true
  audit_interval: "5m"
sweeper:
  kind: nocache
  pass_delay: "500ms"
flush:
  interval: "30s"
  max_active: 4
  retry_delay_on_error: "2m"
  max_batch_size: 50
storage_handler:
  max_active_fetch: 3
  max_active_store: 2
  fetch_timeout: "1h"
  store_timeout: "2h"
  retain_online_custodial: true
storage_classes:
  defaults:
    pending_count: 100
    max_age: "1h"
  classes:
    - name: "raw@osm"
      max_bytes: "5G"
      max_age: "10m"
hsms:
  - instance: "osm"
    type: "osm"
    command: "/usr/share/pool/hsm.sh"
    attributes:
      pnfs: "/pnfs/fs"
namespace:
  dir: "/srv/namespace"
logging:
  log_level: "debug"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pool.gap(), 100 * 1024 * 1024);
        assert!(config.pool.volatile);
        assert_eq!(config.pool.audit_interval, Duration::from_secs(300));
        assert_eq!(config.sweeper.kind, SweeperKind::NoCache);
        assert_eq!(config.sweeper.pass_delay, Duration::from_millis(500));

        let flush = FlushSettings::from(&config.flush);
        assert_eq!(flush.max_active, 4);
        assert_eq!(flush.retry_delay_on_error, Duration::from_secs(120));

        let handler = StorageHandlerSettings::from(&config.storage_handler);
        assert_eq!(handler.max_active_store, 2);
        assert_eq!(handler.store_timeout, Duration::from_secs(7200));
        assert!(handler.retain_online_custodial);
        assert!(handler.check_namespace_before_store);

        let defaults = config.storage_classes.defaults.to_settings();
        assert_eq!(defaults.pending_count, 100);
        assert_eq!(defaults.max_bytes, 0);

        let class = &config.storage_classes.classes[0];
        assert_eq!(class.key().unwrap(), StorageClassKey::new("osm", "raw"));
        assert_eq!(class.to_settings().max_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(class.to_settings().max_age, Duration::from_secs(600));

        assert_eq!(config.hsms[0].hsm_type, "osm");
        assert_eq!(config.hsms[0].attributes["pnfs"], "/pnfs/fs");
        assert_eq!(config.logging.log_level, "debug");
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = Config::default();
        config.validate().unwrap();

        config.pool.gap = Some(config.pool.total_space);
        assert!(matches!(config.validate(), Err(PoolError::ConfigError(_))));
        config.pool.gap = None;

        config.hsms = vec![
            HsmDefinition::new("osm", "osm", "/bin/true"),
            HsmDefinition::new("osm", "osm", "/bin/true"),
        ];
        assert!(config.validate().is_err());
        config.hsms.pop();
        config.validate().unwrap();

        config.storage_classes.classes.push(StorageClassDefinition {
            name: "no-hsm-part".to_string(),
            pending_count: 0,
            max_bytes: 0,
            max_age: Duration::from_secs(60),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_size_unit_is_rejected() {
        let yaml = r#"
pool:
  total_space: "12Q"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }
}
