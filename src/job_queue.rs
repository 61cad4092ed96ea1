//! Job Queue Module
//!
//! A FIFO job scheduler with a bounded number of worker slots. The storage
//! handler runs one scheduler for fetch jobs and one for store jobs.
//!
//! A job leaves the scheduler exactly once: either through [`Job::run`] (it
//! was started) or through [`Job::unqueued`] (it was killed or the scheduler
//! shut down before it started). Running jobs are killed by cancelling the
//! token handed to `run`.

use crate::replica_types::PnfsId;
use crate::{PoolError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub trait Job: Send + Sync + 'static {
    fn pnfs_id(&self) -> &PnfsId;

    /// Executes the job. Must observe `cancel` and return promptly once it fires.
    fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()>;

    /// Called instead of `run` when the job is removed before it started.
    fn unqueued(self: Arc<Self>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: u64,
    pub pnfs_id: PnfsId,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

struct QueuedJob {
    id: u64,
    job: Arc<dyn Job>,
    submitted_at: DateTime<Utc>,
}

struct ActiveJob {
    pnfs_id: PnfsId,
    cancel: CancellationToken,
    submitted_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
}

struct SchedulerState {
    queue: VecDeque<QueuedJob>,
    active: HashMap<u64, ActiveJob>,
    max_active: usize,
    next_id: u64,
    shut_down: bool,
}

pub struct JobScheduler {
    name: String,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

impl JobScheduler {
    pub fn new(name: &str, max_active: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                active: HashMap::new(),
                max_active,
                next_id: 1,
                shut_down: false,
            }),
            idle: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job and starts it if a worker slot is free. Returns the job id.
    pub fn add(self: &Arc<Self>, job: Arc<dyn Job>) -> Result<u64> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.shut_down {
                return Err(PoolError::Unqueued(format!(
                    "{} queue is shut down",
                    self.name
                )));
            }
            let id = state.next_id;
            state.next_id += 1;
            debug!("Queued {} job {} for {}", self.name, id, job.pnfs_id());
            state.queue.push_back(QueuedJob {
                id,
                job,
                submitted_at: Utc::now(),
            });
            id
        };
        self.dispatch();
        Ok(id)
    }

    /// Starts queued jobs while worker slots are free.
    fn dispatch(self: &Arc<Self>) {
        loop {
            let (id, job, cancel) = {
                let mut state = self.state.lock().unwrap();
                if state.shut_down || state.active.len() >= state.max_active {
                    return;
                }
                let queued = match state.queue.pop_front() {
                    Some(queued) => queued,
                    None => return,
                };
                let cancel = CancellationToken::new();
                state.active.insert(
                    queued.id,
                    ActiveJob {
                        pnfs_id: queued.job.pnfs_id().clone(),
                        cancel: cancel.clone(),
                        submitted_at: queued.submitted_at,
                        started_at: Utc::now(),
                    },
                );
                (queued.id, queued.job, cancel)
            };

            debug!("Starting {} job {} for {}", self.name, id, job.pnfs_id());
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                // Frees the slot even if the job panics
                let _slot = scopeguard::guard(scheduler, move |scheduler| scheduler.finished(id));
                job.run(cancel).await;
            });
        }
    }

    fn finished(self: &Arc<Self>, id: u64) {
        let idle = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(&id);
            state.active.is_empty()
        };
        debug!("{} job {} finished", self.name, id);
        self.dispatch();
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Kills a job: a queued job is unqueued, a running job is cancelled.
    pub fn kill(&self, id: u64) -> Result<()> {
        let queued = {
            let mut state = self.state.lock().unwrap();
            if let Some(active) = state.active.get(&id) {
                info!("Killing active {} job {} for {}", self.name, id, active.pnfs_id);
                active.cancel.cancel();
                return Ok(());
            }
            match state.queue.iter().position(|q| q.id == id) {
                Some(position) => state.queue.remove(position),
                None => None,
            }
        };
        match queued {
            Some(queued) => {
                info!("Removing queued {} job {} for {}", self.name, id, queued.job.pnfs_id());
                queued.job.unqueued();
                Ok(())
            }
            None => Err(PoolError::InvalidRequest(format!(
                "No such {} job: {}",
                self.name, id
            ))),
        }
    }

    /// Id of the job working on `pnfs_id`, if any.
    pub fn find(&self, pnfs_id: &PnfsId) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state
            .active
            .iter()
            .find(|(_, a)| &a.pnfs_id == pnfs_id)
            .map(|(id, _)| *id)
            .or_else(|| {
                state
                    .queue
                    .iter()
                    .find(|q| q.job.pnfs_id() == pnfs_id)
                    .map(|q| q.id)
            })
    }

    pub fn set_max_active(self: &Arc<Self>, max_active: usize) {
        self.state.lock().unwrap().max_active = max_active;
        info!("Maximum active {} jobs set to {}", self.name, max_active);
        self.dispatch();
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Active jobs by id, then queued jobs in queue order.
    pub fn list(&self) -> Vec<JobInfo> {
        let state = self.state.lock().unwrap();
        let mut active: Vec<JobInfo> = state
            .active
            .iter()
            .map(|(id, a)| JobInfo {
                id: *id,
                pnfs_id: a.pnfs_id.clone(),
                status: JobStatus::Active,
                submitted_at: a.submitted_at,
                started_at: Some(a.started_at),
            })
            .collect();
        active.sort_by_key(|j| j.id);
        active.extend(state.queue.iter().map(|q| JobInfo {
            id: q.id,
            pnfs_id: q.job.pnfs_id().clone(),
            status: JobStatus::Queued,
            submitted_at: q.submitted_at,
            started_at: None,
        }));
        active
    }

    /// Cancels every running job.
    pub fn cancel_active(&self) {
        let state = self.state.lock().unwrap();
        for active in state.active.values() {
            active.cancel.cancel();
        }
    }

    /// Refuses new jobs, unqueues waiting ones and cancels running ones.
    pub fn shutdown(&self) {
        let queued: Vec<QueuedJob> = {
            let mut state = self.state.lock().unwrap();
            state.shut_down = true;
            for active in state.active.values() {
                active.cancel.cancel();
            }
            state.queue.drain(..).collect()
        };
        if !queued.is_empty() {
            info!("Unqueuing {} {} jobs on shutdown", queued.len(), self.name);
        }
        for queued in queued {
            queued.job.unqueued();
        }
    }

    /// Waits until no job is running. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "{} jobs still running after {:?}",
                    self.active_count(),
                    timeout
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        started: AtomicUsize,
        finished: AtomicUsize,
        cancelled: AtomicUsize,
        unqueued: AtomicUsize,
    }

    struct SleepJob {
        id: PnfsId,
        duration: Duration,
        counters: Arc<Counters>,
    }

    impl Job for SleepJob {
        fn pnfs_id(&self) -> &PnfsId {
            &self.id
        }

        fn run(self: Arc<Self>, cancel: CancellationToken) -> BoxFuture<'static, ()> {
            async move {
                self.counters.started.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(self.duration) => {
                        self.counters.finished.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = cancel.cancelled() => {
                        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            .boxed()
        }

        fn unqueued(self: Arc<Self>) {
            self.counters.unqueued.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn job(n: u32, millis: u64, counters: &Arc<Counters>) -> Arc<dyn Job> {
        Arc::new(SleepJob {
            id: PnfsId::new(&format!("{:04X}", n)).unwrap(),
            duration: Duration::from_millis(millis),
            counters: Arc::clone(counters),
        })
    }

    #[tokio::test]
    async fn test_respects_max_active() {
        let scheduler = JobScheduler::new("fetch", 2);
        let counters = Arc::new(Counters::default());
        for n in 0..5 {
            scheduler.add(job(n, 10_000, &counters)).unwrap();
        }
        assert_eq!(scheduler.active_count(), 2);
        assert_eq!(scheduler.queue_size(), 3);

        let list = scheduler.list();
        assert_eq!(list.len(), 5);
        assert_eq!(list[0].status, JobStatus::Active);
        assert_eq!(list[4].status, JobStatus::Queued);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_queued_jobs_start_when_slots_free() {
        let scheduler = JobScheduler::new("store", 1);
        let counters = Arc::new(Counters::default());
        for n in 0..3 {
            scheduler.add(job(n, 10, &counters)).unwrap();
        }
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await || scheduler.queue_size() > 0);
        tokio::time::timeout(Duration::from_secs(5), async {
            while counters.finished.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(scheduler.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_kill_queued_and_active_jobs() {
        let scheduler = JobScheduler::new("fetch", 1);
        let counters = Arc::new(Counters::default());
        let active = scheduler.add(job(1, 10_000, &counters)).unwrap();
        let queued = scheduler.add(job(2, 10_000, &counters)).unwrap();

        scheduler.kill(queued).unwrap();
        assert_eq!(counters.unqueued.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.queue_size(), 0);

        scheduler.kill(active).unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 1);
        assert!(scheduler.kill(active).is_err());
    }

    #[tokio::test]
    async fn test_zero_slots_keep_jobs_queued_until_raised() {
        let scheduler = JobScheduler::new("store", 0);
        let counters = Arc::new(Counters::default());
        scheduler.add(job(1, 1, &counters)).unwrap();
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(
            scheduler.find(&PnfsId::new("0001").unwrap()),
            Some(1)
        );

        scheduler.set_max_active(1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while counters.finished.load(Ordering::SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unqueues_and_refuses() {
        let scheduler = JobScheduler::new("fetch", 1);
        let counters = Arc::new(Counters::default());
        scheduler.add(job(1, 10_000, &counters)).unwrap();
        scheduler.add(job(2, 10_000, &counters)).unwrap();

        scheduler.shutdown();
        assert_eq!(counters.unqueued.load(Ordering::SeqCst), 1);
        assert!(scheduler.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(counters.cancelled.load(Ordering::SeqCst), 1);
        assert!(matches!(
            scheduler.add(job(3, 1, &counters)),
            Err(PoolError::Unqueued(_))
        ));
    }
}
