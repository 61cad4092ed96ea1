//! In-flight job tracker for HSM request coalescing.
//!
//! The storage handler keeps one `InFlightTracker` per direction (fetch and
//! store). It guarantees that at most one job exists per file and direction:
//!
//! 1. The first request for a file becomes the "Owner" and schedules the job
//! 2. Later requests become "Waiters" and subscribe to the job's broadcast channel
//! 3. When the job finishes, the owner's guard unregisters the file and then
//!    broadcasts the result, so every waiter observes exactly one completion
//! 4. A request arriving after completion registers a fresh job

use crate::replica_types::PnfsId;
use crate::PoolError;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Outcome broadcast to every waiter of a job.
pub type JobResult = std::result::Result<(), PoolError>;

/// Only needs to hold the single completion message.
const BROADCAST_CHANNEL_CAPACITY: usize = 1;

/// Tracks running HSM jobs so that concurrent requests share one job.
pub struct InFlightTracker {
    pending: Arc<DashMap<PnfsId, broadcast::Sender<JobResult>>>,
}

/// Role assigned to a request after registration.
pub enum JobRole {
    /// First request for the file. Must schedule the job and complete the guard.
    Owner(CompletionGuard, JobWaiter),
    /// A job for the file is already registered.
    Waiter(JobWaiter),
}

/// Completes the registration of a job.
///
/// Dropping the guard without completing it (job panicked or was discarded)
/// unregisters the file and fails all waiters.
pub struct CompletionGuard {
    id: PnfsId,
    sender: broadcast::Sender<JobResult>,
    pending: Arc<DashMap<PnfsId, broadcast::Sender<JobResult>>>,
    completed: bool,
}

/// Future result of a job.
pub struct JobWaiter {
    id: PnfsId,
    receiver: broadcast::Receiver<JobResult>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Registers interest in the job for `id`, creating it if none is running.
    pub fn try_register(&self, id: &PnfsId) -> JobRole {
        match self.pending.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());

                let guard = CompletionGuard {
                    id: id.clone(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                };
                let waiter = JobWaiter {
                    id: id.clone(),
                    receiver: rx,
                };
                JobRole::Owner(guard, waiter)
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => JobRole::Waiter(JobWaiter {
                id: id.clone(),
                receiver: occupied.get().subscribe(),
            }),
        }
    }

    pub fn is_registered(&self, id: &PnfsId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    pub fn ids(&self) -> Vec<PnfsId> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionGuard {
    pub fn id(&self) -> &PnfsId {
        &self.id
    }

    /// Unregisters the job and delivers `result` to all waiters.
    pub fn complete(mut self, result: JobResult) {
        self.completed = true;
        // Unregister first: a request arriving now must start a new job
        self.pending.remove(&self.id);
        let _ = self.sender.send(result);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.id);
            let _ = self.sender.send(Err(PoolError::InternalError(format!(
                "Job for {} ended without a result",
                self.id
            ))));
        }
    }
}

impl JobWaiter {
    pub fn id(&self) -> &PnfsId {
        &self.id
    }

    /// Waits for the job to finish.
    pub async fn wait(mut self) -> JobResult {
        match self.receiver.recv().await {
            Ok(result) => result,
            Err(e) => Err(PoolError::InternalError(format!(
                "Lost completion of job for {}: {}",
                self.id, e
            ))),
        }
    }
}

impl std::fmt::Debug for JobWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWaiter").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PnfsId {
        PnfsId::new(s).unwrap()
    }

    fn owner(tracker: &InFlightTracker, s: &str) -> (CompletionGuard, JobWaiter) {
        match tracker.try_register(&id(s)) {
            JobRole::Owner(guard, waiter) => (guard, waiter),
            JobRole::Waiter(_) => panic!("Expected Owner, got Waiter"),
        }
    }

    #[test]
    fn test_first_register_returns_owner() {
        let tracker = InFlightTracker::new();
        let _owner = owner(&tracker, "0001");
        assert_eq!(tracker.in_flight_count(), 1);
        assert!(tracker.is_registered(&id("0001")));
    }

    #[test]
    fn test_second_register_returns_waiter() {
        let tracker = InFlightTracker::new();
        let _owner = owner(&tracker, "0001");

        match tracker.try_register(&id("0001")) {
            JobRole::Owner(..) => panic!("Expected Waiter, got Owner"),
            JobRole::Waiter(_) => {}
        }
        assert_eq!(tracker.in_flight_count(), 1);
    }

    #[test]
    fn test_complete_removes_entry() {
        let tracker = InFlightTracker::new();
        let (guard, _waiter) = owner(&tracker, "0001");
        guard.complete(Ok(()));
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn test_new_register_after_completion() {
        let tracker = InFlightTracker::new();
        let (guard, _) = owner(&tracker, "0001");
        guard.complete(Ok(()));

        match tracker.try_register(&id("0001")) {
            JobRole::Owner(..) => {}
            JobRole::Waiter(_) => panic!("Expected Owner after completion"),
        }
    }

    #[tokio::test]
    async fn test_all_waiters_receive_the_same_result() {
        let tracker = InFlightTracker::new();
        let (guard, first) = owner(&tracker, "0001");
        let second = match tracker.try_register(&id("0001")) {
            JobRole::Waiter(waiter) => waiter,
            JobRole::Owner(..) => panic!("Expected Waiter"),
        };

        tokio::spawn(async move {
            guard.complete(Err(PoolError::HsmCommandFailed {
                code: 31,
                message: "tape offline".to_string(),
            }));
        });

        let a = first.wait().await.unwrap_err();
        let b = second.wait().await.unwrap_err();
        assert_eq!(a, b);
        assert!(a.is_transient());
    }

    #[tokio::test]
    async fn test_waiter_fails_when_guard_dropped() {
        let tracker = InFlightTracker::new();
        let (guard, waiter) = owner(&tracker, "0001");
        drop(guard);

        assert_eq!(tracker.in_flight_count(), 0);
        assert!(matches!(
            waiter.wait().await,
            Err(PoolError::InternalError(_))
        ));
    }

    #[test]
    fn test_different_files_are_independent() {
        let tracker = InFlightTracker::new();
        let _a = owner(&tracker, "0001");
        let _b = owner(&tracker, "0002");
        assert_eq!(tracker.in_flight_count(), 2);
        let mut ids = tracker.ids();
        ids.sort();
        assert_eq!(ids, vec![id("0001"), id("0002")]);
    }
}
