//! HSM Pool - disk cache tier of a tape-backed storage system
//!
//! This library provides the core of a storage pool: the replica repository and
//! its space accounting, the sweeper that reclaims space, the per storage class
//! flush queues, and the storage handler that restores files from and flushes
//! files to an HSM through external commands.

pub mod account;
pub mod config;
pub mod error;
pub mod flush_controller;
pub mod hsm_command;
pub mod hsm_set;
pub mod inflight_tracker;
pub mod job_queue;
pub mod logging;
pub mod metadata_store;
pub mod metrics;
pub mod namespace;
pub mod pool;
pub mod replica_types;
pub mod repository;
pub mod shutdown;
pub mod storage_class;
pub mod storage_class_container;
pub mod storage_handler;
pub mod sweeper;

pub use error::{PoolError, Result};
