//! Metrics Collection Module
//!
//! Counters for HSM transfers, space reclamation, flush batches and the space
//! audit. Counters are updated from synchronous event handlers, so they are
//! plain atomics rather than async locks.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of all pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub fetch_succeeded: u64,
    pub fetch_failed: u64,
    pub bytes_fetched: u64,
    pub store_succeeded: u64,
    pub store_failed: u64,
    pub bytes_stored: u64,
    pub jobs_killed: u64,
    pub notify_retries: u64,
    pub replicas_reclaimed: u64,
    pub bytes_reclaimed: u64,
    pub flush_batches: u64,
    pub flush_batch_failures: u64,
    pub audit_warnings: u64,
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    fetch_succeeded: AtomicU64,
    fetch_failed: AtomicU64,
    bytes_fetched: AtomicU64,
    store_succeeded: AtomicU64,
    store_failed: AtomicU64,
    bytes_stored: AtomicU64,
    jobs_killed: AtomicU64,
    notify_retries: AtomicU64,
    replicas_reclaimed: AtomicU64,
    bytes_reclaimed: AtomicU64,
    flush_batches: AtomicU64,
    flush_batch_failures: AtomicU64,
    audit_warnings: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch(&self, success: bool, bytes: u64) {
        if success {
            self.fetch_succeeded.fetch_add(1, Ordering::Relaxed);
            self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.fetch_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_store(&self, success: bool, bytes: u64) {
        if success {
            self.store_succeeded.fetch_add(1, Ordering::Relaxed);
            self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.store_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_job_killed(&self) {
        self.jobs_killed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notify_retry(&self) {
        self.notify_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, replicas: u64, bytes: u64) {
        self.replicas_reclaimed.fetch_add(replicas, Ordering::Relaxed);
        self.bytes_reclaimed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A flush batch finished; `failures` counts its failed replicas.
    pub fn record_flush_batch(&self, failures: usize) {
        self.flush_batches.fetch_add(1, Ordering::Relaxed);
        if failures > 0 {
            self.flush_batch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_audit_warning(&self) {
        self.audit_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fetch_succeeded: self.fetch_succeeded.load(Ordering::Relaxed),
            fetch_failed: self.fetch_failed.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            store_succeeded: self.store_succeeded.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            jobs_killed: self.jobs_killed.load(Ordering::Relaxed),
            notify_retries: self.notify_retries.load(Ordering::Relaxed),
            replicas_reclaimed: self.replicas_reclaimed.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            flush_batches: self.flush_batches.load(Ordering::Relaxed),
            flush_batch_failures: self.flush_batch_failures.load(Ordering::Relaxed),
            audit_warnings: self.audit_warnings.load(Ordering::Relaxed),
        }
    }
}
