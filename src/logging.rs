//! Logging Module
//!
//! Application logging through `tracing`: a console layer and a daily rolling
//! file under `<app_log_dir>/<hostname>/`, filtered by the configured level
//! unless `RUST_LOG` says otherwise.

use crate::{PoolError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "hsm-pool.log";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub app_log_dir: PathBuf,
    pub hostname: String,
    pub log_level: String,
    /// Days of log files to keep, 0 keeps everything.
    pub retention_days: u32,
}

/// Logger manager for handling all logging operations
pub struct LoggerManager {
    pub config: LoggingConfig,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Create a new logger manager from config module types
    pub fn from_config(config: &crate::config::LoggingConfig, hostname: String) -> Self {
        Self::new(LoggingConfig {
            app_log_dir: config.app_log_dir.clone(),
            hostname,
            log_level: config.log_level.clone(),
            retention_days: config.retention_days,
        })
    }

    pub fn host_log_dir(&self) -> PathBuf {
        self.config.app_log_dir.join(&self.config.hostname)
    }

    /// Initialize the logging system
    pub fn initialize(&self) -> Result<()> {
        let host_log_dir = self.host_log_dir();
        std::fs::create_dir_all(&host_log_dir).map_err(|e| {
            PoolError::IoError(format!("Failed to create app log directory: {}", e))
        })?;

        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, host_log_dir.clone(), LOG_FILE_PREFIX);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!(
                    "Application logging initialized for host: {}",
                    self.config.hostname
                );
                info!("Application logs will be written to: {:?}", host_log_dir);
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Removes log files older than the retention period. Returns the number removed.
    pub fn cleanup_old_logs(&self) -> Result<usize> {
        if self.config.retention_days == 0 {
            return Ok(0);
        }
        let keep = Duration::from_secs(self.config.retention_days as u64 * 24 * 3600);
        let cutoff_time = SystemTime::now()
            .checked_sub(keep)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(remove_files_older_than(&self.host_log_dir(), cutoff_time))
    }
}

fn remove_files_older_than(log_dir: &Path, cutoff_time: SystemTime) -> usize {
    let mut removed = 0;
    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let modified = entry.metadata().and_then(|metadata| metadata.modified());
            match modified {
                Ok(modified) if modified < cutoff_time => {
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
                    } else {
                        debug!("Removed old log file: {:?}", entry.path());
                        removed += 1;
                    }
                }
                _ => {}
            }
        }
    }
    removed
}
