//! Sweeper Module
//!
//! Space reclamation. A sweeper listens to repository events and decides which
//! replicas to delete when the pool needs space. Three policies exist:
//!
//! - [`LruSweeper`]: keeps an index of removable replicas ordered by the time
//!   they became removable (oldest first) and evicts from the head on demand
//! - [`NoCacheSweeper`]: deletes every replica as soon as it becomes removable
//! - [`NullSweeper`]: never deletes anything
//!
//! Index membership is advisory. Every candidate is re-validated against the
//! repository before it is removed.

use crate::metrics::PoolMetrics;
use crate::replica_types::{CacheEntry, PnfsId};
use crate::repository::{ReplicaEvent, ReplicaListener, ReplicaRepository};
use crate::shutdown::ShutdownSignal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sweeper implementation selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweeperKind {
    #[default]
    Lru,
    NoCache,
    None,
}

pub trait Sweeper: ReplicaListener {
    /// Sum of the sizes of all replicas in the eviction index.
    fn removable_space(&self) -> u64;

    /// Age in seconds of the least recently used removable replica, 0 if none.
    fn lru_seconds(&self) -> u64;

    /// Asks the sweeper to free `bytes` more bytes.
    fn reclaim(&self, bytes: u64);

    /// Bytes requested but not yet freed.
    fn pending_reclaim(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the background task, if the policy has one.
    fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> Option<JoinHandle<()>>;
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    seq: u64,
    size: u64,
    since: SystemTime,
}

/// Removable replicas ordered by insertion sequence.
#[derive(Debug, Default)]
struct LruIndex {
    order: BTreeMap<u64, PnfsId>,
    entries: HashMap<PnfsId, IndexEntry>,
    next_seq: u64,
    removable_space: u64,
}

impl LruIndex {
    /// Inserts at the tail, moving the entry there if already present.
    fn insert(&mut self, id: &PnfsId, size: u64, since: SystemTime) {
        self.remove(id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, id.clone());
        self.entries.insert(id.clone(), IndexEntry { seq, size, since });
        self.removable_space += size;
    }

    fn remove(&mut self, id: &PnfsId) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                self.order.remove(&entry.seq);
                self.removable_space -= entry.size;
                true
            }
            None => false,
        }
    }

    fn contains(&self, id: &PnfsId) -> bool {
        self.entries.contains_key(id)
    }

    fn head(&self) -> Option<&IndexEntry> {
        self.order
            .values()
            .next()
            .and_then(|id| self.entries.get(id))
    }

    /// Ids and sizes from head to tail.
    fn candidates(&self) -> Vec<(PnfsId, u64)> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id).map(|e| (id.clone(), e.size)))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Least-recently-made-removable eviction.
pub struct LruSweeper {
    repository: Arc<ReplicaRepository>,
    index: Mutex<LruIndex>,
    need_space: AtomicU64,
    wake: Notify,
    pass_delay: Duration,
    metrics: Arc<PoolMetrics>,
}

impl LruSweeper {
    pub fn new(
        repository: Arc<ReplicaRepository>,
        pass_delay: Duration,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            repository,
            index: Mutex::new(LruIndex::default()),
            need_space: AtomicU64::new(0),
            wake: Notify::new(),
            pass_delay,
            metrics,
        }
    }

    pub fn contains(&self, id: &PnfsId) -> bool {
        self.index.lock().unwrap().contains(id)
    }

    /// Index content from oldest to newest.
    pub fn ids(&self) -> Vec<PnfsId> {
        self.index
            .lock()
            .unwrap()
            .candidates()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Runs one reclaim pass and returns the number of bytes freed.
    ///
    /// Walks the index from the head and selects removable replicas until
    /// their sizes cover the pending request, then removes them. Replicas the
    /// repository refuses to remove stay in the index for the next pass.
    pub fn sweep(&self) -> u64 {
        let needed = self.need_space.load(Ordering::SeqCst);
        if needed == 0 {
            return 0;
        }

        let candidates = self.index.lock().unwrap().candidates();
        let mut selected = Vec::new();
        let mut selected_bytes = 0u64;
        for (id, size) in candidates {
            if selected_bytes >= needed {
                break;
            }
            match self.repository.get_entry(&id) {
                Ok(entry) if entry.is_removable() => {
                    selected.push(id);
                    selected_bytes += size;
                }
                Ok(entry) => debug!(
                    "Skipping {}: state={}, links={}, locked={}, sticky={}",
                    id,
                    entry.state,
                    entry.link_count,
                    entry.locked,
                    entry.is_sticky()
                ),
                Err(_) => {
                    debug!("Dropping {} from eviction index, it no longer exists", id);
                    self.index.lock().unwrap().remove(&id);
                }
            }
        }

        let mut freed = 0u64;
        let mut removed = 0u64;
        for id in selected {
            match self.repository.remove(&id) {
                Ok(size) => {
                    freed += size;
                    removed += 1;
                }
                Err(e) => debug!("Could not remove {}: {}", id, e),
            }
        }

        let _ = self
            .need_space
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(freed))
            });
        if removed > 0 {
            info!("Reclaimed {} bytes by removing {} replicas", freed, removed);
            self.metrics.record_reclaimed(removed, freed);
        }
        freed
    }

    fn has_work(&self) -> bool {
        self.need_space.load(Ordering::SeqCst) > 0 && self.index.lock().unwrap().len() > 0
    }

    async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        info!("LRU sweeper started (pass delay {:?})", self.pass_delay);
        loop {
            if self.has_work() {
                let freed = self.sweep();
                if freed == 0 {
                    debug!(
                        "Sweep pass freed nothing, {} bytes still requested",
                        self.pending_reclaim()
                    );
                }
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(self.pass_delay) => {}
                }
            } else {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = self.wake.notified() => {}
                }
            }
        }
        info!("LRU sweeper stopped");
    }

    fn insert(&self, entry: &CacheEntry) {
        self.index
            .lock()
            .unwrap()
            .insert(&entry.id, entry.size, entry.last_accessed_at);
        if self.need_space.load(Ordering::SeqCst) > 0 {
            self.wake.notify_one();
        }
    }
}

impl ReplicaListener for LruSweeper {
    fn on_event(&self, event: &ReplicaEvent) {
        match event {
            ReplicaEvent::Cached(entry) | ReplicaEvent::Scanned(entry) => {
                if entry.is_removable() {
                    self.insert(entry);
                }
            }
            ReplicaEvent::Sticky(entry) => {
                if entry.is_sticky() {
                    self.index.lock().unwrap().remove(&entry.id);
                } else if entry.is_removable() {
                    self.insert(entry);
                }
            }
            ReplicaEvent::Touched(entry) => {
                let present = self.index.lock().unwrap().contains(&entry.id);
                if present || entry.is_removable() {
                    self.insert(entry);
                }
            }
            ReplicaEvent::Removed(entry) | ReplicaEvent::Precious(entry) => {
                self.index.lock().unwrap().remove(&entry.id);
            }
            ReplicaEvent::NeedSpace(bytes) => self.reclaim(*bytes),
            ReplicaEvent::Created(_) => {}
        }
    }
}

impl Sweeper for LruSweeper {
    fn removable_space(&self) -> u64 {
        self.index.lock().unwrap().removable_space
    }

    fn lru_seconds(&self) -> u64 {
        let since = match self.index.lock().unwrap().head() {
            Some(head) => head.since,
            None => return 0,
        };
        SystemTime::now()
            .duration_since(since)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn reclaim(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.need_space.fetch_add(bytes, Ordering::SeqCst);
        debug!("Asked to reclaim {} bytes", bytes);
        self.wake.notify_one();
    }

    fn pending_reclaim(&self) -> u64 {
        self.need_space.load(Ordering::SeqCst)
    }

    fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> Option<JoinHandle<()>> {
        Some(tokio::spawn(self.run(shutdown)))
    }
}

/// Deletes every replica as soon as it becomes removable.
///
/// Listeners cannot mutate the repository, so removable ids are handed to a
/// task that removes them.
pub struct NoCacheSweeper {
    repository: Arc<ReplicaRepository>,
    sender: mpsc::UnboundedSender<PnfsId>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PnfsId>>>,
    metrics: Arc<PoolMetrics>,
}

impl NoCacheSweeper {
    pub fn new(repository: Arc<ReplicaRepository>, metrics: Arc<PoolMetrics>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            repository,
            sender,
            receiver: Mutex::new(Some(receiver)),
            metrics,
        }
    }

    fn evict(&self, id: &PnfsId) {
        match self.repository.remove(id) {
            Ok(size) => {
                debug!("Removed {} ({} bytes) right after it became cached", id, size);
                self.metrics.record_reclaimed(1, size);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!("Could not remove {}: {}", id, e),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<PnfsId>,
        mut shutdown: ShutdownSignal,
    ) {
        info!("No-cache sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                id = receiver.recv() => match id {
                    Some(id) => self.evict(&id),
                    None => break,
                },
            }
        }
        info!("No-cache sweeper stopped");
    }
}

impl ReplicaListener for NoCacheSweeper {
    fn on_event(&self, event: &ReplicaEvent) {
        match event {
            ReplicaEvent::Cached(entry)
            | ReplicaEvent::Scanned(entry)
            | ReplicaEvent::Touched(entry)
            | ReplicaEvent::Sticky(entry)
                if entry.is_removable() =>
            {
                let _ = self.sender.send(entry.id.clone());
            }
            _ => {}
        }
    }
}

impl Sweeper for NoCacheSweeper {
    fn removable_space(&self) -> u64 {
        0
    }

    fn lru_seconds(&self) -> u64 {
        0
    }

    fn reclaim(&self, _bytes: u64) {}

    fn pending_reclaim(&self) -> u64 {
        0
    }

    fn len(&self) -> usize {
        0
    }

    fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> Option<JoinHandle<()>> {
        let receiver = self.receiver.lock().unwrap().take();
        match receiver {
            Some(receiver) => Some(tokio::spawn(self.run(receiver, shutdown))),
            None => {
                warn!("No-cache sweeper already started");
                None
            }
        }
    }
}

/// Never removes anything.
#[derive(Debug, Default)]
pub struct NullSweeper;

impl ReplicaListener for NullSweeper {
    fn on_event(&self, _event: &ReplicaEvent) {}
}

impl Sweeper for NullSweeper {
    fn removable_space(&self) -> u64 {
        0
    }

    fn lru_seconds(&self) -> u64 {
        0
    }

    fn reclaim(&self, bytes: u64) {
        if bytes > 0 {
            debug!("Ignoring request to reclaim {} bytes", bytes);
        }
    }

    fn pending_reclaim(&self) -> u64 {
        0
    }

    fn len(&self) -> usize {
        0
    }

    fn start(self: Arc<Self>, _shutdown: ShutdownSignal) -> Option<JoinHandle<()>> {
        None
    }
}

/// Creates the configured sweeper and registers it with the repository.
pub fn build_sweeper(
    kind: SweeperKind,
    repository: &Arc<ReplicaRepository>,
    pass_delay: Duration,
    metrics: Arc<PoolMetrics>,
) -> Arc<dyn Sweeper> {
    match kind {
        SweeperKind::Lru => {
            let sweeper = Arc::new(LruSweeper::new(Arc::clone(repository), pass_delay, metrics));
            repository.add_listener(sweeper.clone());
            sweeper
        }
        SweeperKind::NoCache => {
            let sweeper = Arc::new(NoCacheSweeper::new(Arc::clone(repository), metrics));
            repository.add_listener(sweeper.clone());
            sweeper
        }
        SweeperKind::None => Arc::new(NullSweeper),
    }
}
