use hsm_pool::account::Account;
use hsm_pool::metadata_store::MemoryMetaDataStore;
use hsm_pool::metrics::PoolMetrics;
use hsm_pool::replica_types::{FileAttributes, PnfsId, ReplicaState, StorageInfo};
use hsm_pool::repository::ReplicaRepository;
use hsm_pool::shutdown::ShutdownCoordinator;
use hsm_pool::sweeper::{build_sweeper, LruSweeper, Sweeper, SweeperKind};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn repository(dir: &TempDir, total: u64) -> Arc<ReplicaRepository> {
    Arc::new(
        ReplicaRepository::new(
            dir.path().join("data"),
            Box::new(MemoryMetaDataStore::new()),
            Arc::new(Account::new(total)),
        )
        .unwrap(),
    )
}

fn lru_sweeper(repository: &Arc<ReplicaRepository>) -> Arc<LruSweeper> {
    let sweeper = Arc::new(LruSweeper::new(
        Arc::clone(repository),
        Duration::from_millis(10),
        Arc::new(PoolMetrics::new()),
    ));
    repository.add_listener(sweeper.clone());
    sweeper
}

fn add_replica(
    repository: &Arc<ReplicaRepository>,
    id: &str,
    size: usize,
    target: ReplicaState,
) -> PnfsId {
    let id = PnfsId::new(id).unwrap();
    let attributes = FileAttributes::new(id.clone(), size as u64, StorageInfo::new("osm", "raw"));
    let handle = repository
        .create_entry(attributes, ReplicaState::ReceivingFromClient, target, Vec::new())
        .unwrap();
    std::fs::write(handle.file(), vec![7u8; size]).unwrap();
    handle.commit().unwrap();
    id
}

#[test]
fn test_reclaim_removes_oldest_until_request_is_covered() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 10_000);
    let sweeper = lru_sweeper(&repository);

    for id in ["0001", "0002", "0003"] {
        add_replica(&repository, id, 400, ReplicaState::Cached);
    }
    assert_eq!(sweeper.removable_space(), 1200);

    sweeper.reclaim(1000);
    assert_eq!(sweeper.sweep(), 1200);

    assert_eq!(sweeper.len(), 0);
    assert_eq!(sweeper.removable_space(), 0);
    assert_eq!(sweeper.pending_reclaim(), 0);
    assert!(repository.is_empty());
    assert_eq!(repository.account().used(), 0);
}

#[test]
fn test_reclaim_keeps_newest_replicas() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 10_000);
    let sweeper = lru_sweeper(&repository);

    let ids: Vec<PnfsId> = ["0001", "0002", "0003", "0004"]
        .iter()
        .map(|id| add_replica(&repository, id, 400, ReplicaState::Cached))
        .collect();

    sweeper.reclaim(1000);
    sweeper.sweep();

    assert_eq!(sweeper.ids(), vec![ids[3].clone()]);
    assert_eq!(sweeper.removable_space(), 400);
    assert!(repository.contains(&ids[3]));
    assert!(!repository.contains(&ids[0]));
}

#[test]
fn test_linked_replica_is_never_evicted() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 10_000);
    let sweeper = lru_sweeper(&repository);
    let id = add_replica(&repository, "00F1", 400, ReplicaState::Cached);

    let reader = repository.open_entry(&id).unwrap();
    sweeper.reclaim(400);
    assert_eq!(sweeper.sweep(), 0);
    assert!(repository.contains(&id));
    assert_eq!(sweeper.pending_reclaim(), 400);

    // Closing the last link makes it eligible again
    drop(reader);
    assert!(sweeper.contains(&id));
    assert_eq!(sweeper.sweep(), 400);
    assert!(!repository.contains(&id));
}

#[test]
fn test_sticky_replica_leaves_index() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 10_000);
    let sweeper = lru_sweeper(&repository);
    let id = add_replica(&repository, "00F2", 100, ReplicaState::Cached);
    assert!(sweeper.contains(&id));

    repository.set_sticky(&id, "door", None, true).unwrap();
    assert!(!sweeper.contains(&id));
    assert_eq!(sweeper.removable_space(), 0);

    let past = SystemTime::now() - Duration::from_secs(1);
    repository.set_sticky(&id, "door", Some(past), true).unwrap();
    assert!(sweeper.contains(&id));
    assert_eq!(sweeper.removable_space(), 100);
}

#[test]
fn test_precious_replica_is_indexed_once_cached() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 10_000);
    let sweeper = lru_sweeper(&repository);
    let id = add_replica(&repository, "00F3", 100, ReplicaState::Precious);
    assert!(!sweeper.contains(&id));

    repository.set_state(&id, ReplicaState::Cached, false).unwrap();
    assert!(sweeper.contains(&id));

    repository.set_state(&id, ReplicaState::Precious, true).unwrap();
    assert!(!sweeper.contains(&id));
    assert_eq!(sweeper.removable_space(), 0);
}

#[tokio::test]
async fn test_blocked_allocation_is_served_by_sweeper() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 1000);
    let sweeper = build_sweeper(
        SweeperKind::Lru,
        &repository,
        Duration::from_millis(10),
        Arc::new(PoolMetrics::new()),
    );
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = Arc::clone(&sweeper).start(coordinator.signal()).unwrap();

    let old = add_replica(&repository, "0A01", 600, ReplicaState::Cached);

    let attributes = FileAttributes::new(PnfsId::new("0A02").unwrap(), 800, StorageInfo::new("osm", "raw"));
    let mut handle = repository
        .create_entry(attributes, ReplicaState::ReceivingFromStore, ReplicaState::Cached, Vec::new())
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.allocate(800))
        .await
        .expect("allocation was not served")
        .unwrap();

    assert!(!repository.contains(&old));
    assert_eq!(repository.account().used(), 800);
    drop(handle);
    assert_eq!(repository.account().used(), 0);

    task.abort();
}

#[tokio::test]
async fn test_nocache_sweeper_removes_cached_replicas() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 10_000);
    let sweeper = build_sweeper(
        SweeperKind::NoCache,
        &repository,
        Duration::from_millis(10),
        Arc::new(PoolMetrics::new()),
    );
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let task = Arc::clone(&sweeper).start(coordinator.signal()).unwrap();

    let precious = add_replica(&repository, "0B01", 100, ReplicaState::Precious);
    let cached = add_replica(&repository, "0B02", 100, ReplicaState::Cached);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while repository.contains(&cached) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!repository.contains(&cached));
    assert!(repository.contains(&precious));

    task.abort();
}

#[tokio::test]
async fn test_null_sweeper_never_evicts() {
    let dir = TempDir::new().unwrap();
    let repository = repository(&dir, 10_000);
    let sweeper = build_sweeper(
        SweeperKind::None,
        &repository,
        Duration::from_millis(10),
        Arc::new(PoolMetrics::new()),
    );
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    assert!(Arc::clone(&sweeper).start(coordinator.signal()).is_none());

    let id = add_replica(&repository, "0C01", 100, ReplicaState::Cached);
    sweeper.reclaim(100);
    assert_eq!(sweeper.pending_reclaim(), 0);
    assert!(repository.contains(&id));
}
