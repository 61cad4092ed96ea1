//! Error Module
//!
//! Defines error types and result types used throughout the pool.
//!
//! Errors are cloneable so that a single job outcome can be delivered to every
//! caller waiting on the same replica.

use std::ops::RangeInclusive;
use thiserror::Error;

/// HSM script exit codes in this range ask the pool to retry the request later.
pub const TRANSIENT_ERROR_CODES: RangeInclusive<i32> = 30..=39;

/// Error code reported to callers when a queued or running job is killed.
pub const JOB_DEQUEUED_CODE: i32 = 44;

/// Error code used when an HSM script reports a malformed location.
pub const BAD_LOCATION_CODE: i32 = 2;

/// Main error type for the pool
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("File not in cache: {0}")]
    FileNotInCache(String),

    #[error("File not found in name space: {0}")]
    FileNotFound(String),

    #[error("File already in cache: {0}")]
    FileInCache(String),

    #[error("Illegal state transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Replica is locked: {0}")]
    Locked(String),

    #[error("Out of space: {0}")]
    NoSpace(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HSM error: {0}")]
    HsmError(String),

    #[error("HSM command failed with exit code {code}: {message}")]
    HsmCommandFailed { code: i32, message: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Job dequeued: {0}")]
    Unqueued(String),

    #[error("Name space error: {0}")]
    NameSpaceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl PoolError {
    /// Numeric error code as reported to callers and flush queues.
    ///
    /// Failed HSM commands report the script's exit code, so an HSM script can
    /// request a retry by exiting with a code in [`TRANSIENT_ERROR_CODES`].
    pub fn code(&self) -> i32 {
        match self {
            PoolError::HsmCommandFailed { code, .. } => *code,
            PoolError::ProtocolError(_) => BAD_LOCATION_CODE,
            PoolError::Unqueued(_) => JOB_DEQUEUED_CODE,
            PoolError::FileNotFound(_) => 10001,
            PoolError::FileNotInCache(_) => 10001,
            PoolError::FileInCache(_) => 210,
            PoolError::Locked(_) => 10009,
            PoolError::NoSpace(_) => 10004,
            PoolError::TimeoutError(_) => 10006,
            PoolError::InconsistentState(_) | PoolError::IllegalTransition { .. } => 10010,
            PoolError::ConfigError(_) | PoolError::HsmError(_) => 10005,
            PoolError::NameSpaceError(_) => 10011,
            PoolError::InvalidRequest(_) => 10012,
            PoolError::IoError(_)
            | PoolError::SerializationError(_)
            | PoolError::InternalError(_)
            | PoolError::SystemError(_) => 10013,
        }
    }

    /// Whether a flush queue should park the request and retry it later.
    pub fn is_transient(&self) -> bool {
        TRANSIENT_ERROR_CODES.contains(&self.code())
    }

    /// Whether the error means the file or replica does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PoolError::FileNotFound(_) | PoolError::FileNotInCache(_)
        )
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PoolError {
    fn from(err: serde_yaml::Error) -> Self {
        PoolError::SerializationError(err.to_string())
    }
}

/// Result type alias for the pool
pub type Result<T> = std::result::Result<T, PoolError>;
