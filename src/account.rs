//! Space Accounting Module
//!
//! Byte accounting for the pool: total, used, precious and removable space.
//! Every counter is maintained incrementally so that reads are O(1).

use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Upper bound of the default gap.
pub const DEFAULT_GAP: u64 = 4 * 1024 * 1024 * 1024;

/// Space usage as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub total: u64,
    pub free: u64,
    pub precious: u64,
    pub removable: u64,
    /// Age of the least recently used removable replica.
    pub lru_seconds: u64,
    /// Free space below which the pool should start reclaiming.
    pub gap: u64,
}

/// Default gap for a pool of the given size.
pub fn default_gap(total: u64) -> u64 {
    (total / 4).min(DEFAULT_GAP)
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total: u64,
    used: u64,
    precious: u64,
    removable: u64,
}

/// Pool space account.
///
/// Allocations that do not fit either fail or wait until [`Account::free`]
/// releases enough space.
pub struct Account {
    counters: Mutex<Counters>,
    space_freed: Notify,
}

impl Account {
    pub fn new(total: u64) -> Self {
        Self {
            counters: Mutex::new(Counters {
                total,
                ..Default::default()
            }),
            space_freed: Notify::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.counters.lock().unwrap().total
    }

    pub fn used(&self) -> u64 {
        self.counters.lock().unwrap().used
    }

    pub fn free_space(&self) -> u64 {
        let c = self.counters.lock().unwrap();
        c.total.saturating_sub(c.used)
    }

    pub fn precious(&self) -> u64 {
        self.counters.lock().unwrap().precious
    }

    pub fn removable(&self) -> u64 {
        self.counters.lock().unwrap().removable
    }

    /// Changes the pool size. The pool cannot shrink below what is in use.
    pub fn set_total(&self, total: u64) -> Result<()> {
        let mut c = self.counters.lock().unwrap();
        if total < c.used {
            return Err(PoolError::InvalidRequest(format!(
                "Cannot set pool size to {} bytes, {} bytes are in use",
                total, c.used
            )));
        }
        c.total = total;
        drop(c);
        self.space_freed.notify_waiters();
        Ok(())
    }

    /// Reserves `size` bytes if they are available.
    pub fn try_allocate(&self, size: u64) -> bool {
        let mut c = self.counters.lock().unwrap();
        if c.total.saturating_sub(c.used) < size {
            return false;
        }
        c.used += size;
        true
    }

    /// Reserves `size` bytes, waiting for space to be freed if necessary.
    ///
    /// `on_shortage` is called with the number of bytes still missing each time
    /// the shortage grows, so that a reclaimer can be asked for exactly that
    /// amount. With `blocking` false a shortage fails with `NoSpace` instead.
    pub async fn allocate<F>(&self, size: u64, blocking: bool, on_shortage: F) -> Result<()>
    where
        F: Fn(u64),
    {
        let mut requested = 0u64;
        loop {
            // Register before checking so a concurrent free cannot be missed
            let notified = self.space_freed.notified();

            let missing = {
                let mut c = self.counters.lock().unwrap();
                let free = c.total.saturating_sub(c.used);
                if free >= size {
                    c.used += size;
                    return Ok(());
                }
                size - free
            };

            if size > self.total() {
                return Err(PoolError::NoSpace(format!(
                    "Allocation of {} bytes exceeds pool size {}",
                    size,
                    self.total()
                )));
            }

            if missing > requested {
                on_shortage(missing - requested);
                requested = missing;
            }

            if !blocking {
                return Err(PoolError::NoSpace(format!(
                    "{} bytes requested, {} bytes missing",
                    size, missing
                )));
            }

            debug!("Waiting for {} bytes of free space", missing);
            notified.await;
        }
    }

    /// Returns `size` bytes to the pool and wakes blocked allocations.
    pub fn free(&self, size: u64) {
        {
            let mut c = self.counters.lock().unwrap();
            if size > c.used {
                warn!(
                    "Freeing {} bytes but only {} bytes are in use, clamping",
                    size, c.used
                );
            }
            c.used = c.used.saturating_sub(size);
        }
        self.space_freed.notify_waiters();
    }

    /// Accounts for data found on disk during the inventory.
    pub fn grow_used(&self, size: u64) {
        let mut c = self.counters.lock().unwrap();
        c.used = c.used.saturating_add(size);
        if c.used > c.total {
            warn!(
                "Inventory found {} bytes on disk, exceeding pool size {}",
                c.used, c.total
            );
        }
    }

    pub fn adjust_precious(&self, delta: i64) {
        let mut c = self.counters.lock().unwrap();
        c.precious = apply_delta(c.precious, delta);
    }

    pub fn adjust_removable(&self, delta: i64) {
        let mut c = self.counters.lock().unwrap();
        c.removable = apply_delta(c.removable, delta);
    }

    /// Total, free, precious and removable space in one consistent read.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        let c = self.counters.lock().unwrap();
        (
            c.total,
            c.total.saturating_sub(c.used),
            c.precious,
            c.removable,
        )
    }

    /// Describes a violation of `precious + removable <= used`, if any.
    ///
    /// Only reports; the counters are left untouched.
    pub fn check_consistency(&self) -> Option<String> {
        let c = self.counters.lock().unwrap();
        let accounted = c.precious.saturating_add(c.removable);
        if c.used < accounted {
            Some(format!(
                "Used space {} is less than precious {} plus removable {}",
                c.used, c.precious, c.removable
            ))
        } else {
            None
        }
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
