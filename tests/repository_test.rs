use hsm_pool::account::Account;
use hsm_pool::metadata_store::FileMetaDataStore;
use hsm_pool::namespace::MemoryNameSpace;
use hsm_pool::replica_types::{FileAttributes, PnfsId, ReplicaState, StorageInfo};
use hsm_pool::repository::ReplicaRepository;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn open_repository(base: &Path) -> Arc<ReplicaRepository> {
    Arc::new(
        ReplicaRepository::new(
            base.join("data"),
            Box::new(FileMetaDataStore::new(base.join("meta")).unwrap()),
            Arc::new(Account::new(10_000)),
        )
        .unwrap(),
    )
}

fn attributes(id: &str, size: u64) -> FileAttributes {
    FileAttributes::new(PnfsId::new(id).unwrap(), size, StorageInfo::new("osm", "raw"))
}

fn add_replica(repository: &Arc<ReplicaRepository>, id: &str, size: usize, target: ReplicaState) {
    let handle = repository
        .create_entry(
            attributes(id, size as u64),
            ReplicaState::ReceivingFromClient,
            target,
            Vec::new(),
        )
        .unwrap();
    std::fs::write(handle.file(), vec![1u8; size]).unwrap();
    handle.commit().unwrap();
}

/// Leaves a replica in its receiving state, as after a crash mid-transfer.
fn add_interrupted(repository: &Arc<ReplicaRepository>, id: &str, size: usize, initial: ReplicaState) {
    let handle = repository
        .create_entry(attributes(id, size as u64), initial, ReplicaState::Precious, Vec::new())
        .unwrap();
    std::fs::write(handle.file(), vec![1u8; size]).unwrap();
    std::mem::forget(handle);
}

#[tokio::test]
async fn test_inventory_restores_replicas_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let repository = open_repository(dir.path());
        add_replica(&repository, "0001", 100, ReplicaState::Precious);
        add_replica(&repository, "0002", 200, ReplicaState::Cached);
    }

    let repository = open_repository(dir.path());
    assert!(repository.is_empty());
    let namespace = MemoryNameSpace::new();

    let report = repository.load(&namespace).await.unwrap();
    assert_eq!(report.loaded, 2);
    assert_eq!(report.removed, 0);

    let precious = PnfsId::new("0001").unwrap();
    let cached = PnfsId::new("0002").unwrap();
    assert_eq!(repository.state(&precious), Some(ReplicaState::Precious));
    assert_eq!(repository.state(&cached), Some(ReplicaState::Cached));
    assert_eq!(repository.get_entry(&cached).unwrap().size, 200);

    let account = repository.account();
    assert_eq!(account.used(), 300);
    assert_eq!(account.precious(), 100);
    assert_eq!(account.removable(), 200);
    assert!(repository.check_consistency().is_none());
}

#[tokio::test]
async fn test_repeated_inventory_changes_nothing() {
    let dir = TempDir::new().unwrap();
    {
        let repository = open_repository(dir.path());
        add_replica(&repository, "0001", 100, ReplicaState::Cached);
    }

    let repository = open_repository(dir.path());
    let namespace = MemoryNameSpace::new();
    repository.load(&namespace).await.unwrap();

    let report = repository.load(&namespace).await.unwrap();
    assert_eq!(report.loaded, 0);
    assert_eq!(report.removed, 0);
    assert_eq!(report.skipped, 1);
    assert_eq!(repository.len(), 1);
    assert_eq!(repository.account().used(), 100);
}

#[tokio::test]
async fn test_data_without_metadata_is_recovered_from_name_space() {
    let dir = TempDir::new().unwrap();
    let repository = open_repository(dir.path());
    let data_dir = dir.path().join("data");

    std::fs::write(data_dir.join("00AA"), vec![0u8; 50]).unwrap();
    std::fs::write(data_dir.join("00BB"), vec![0u8; 70]).unwrap();
    std::fs::write(data_dir.join("00CC"), vec![0u8; 10]).unwrap();
    std::fs::write(data_dir.join("notes.txt"), b"not a replica").unwrap();

    let namespace = MemoryNameSpace::new();
    let mut on_tape = attributes("00AA", 50);
    on_tape.storage_info.add_location("osm://osm/?bfid=1");
    namespace.insert(on_tape);
    namespace.insert(attributes("00BB", 70));

    let report = repository.load(&namespace).await.unwrap();
    assert_eq!(report.loaded, 2);
    assert_eq!(report.removed, 1);

    assert_eq!(
        repository.state(&PnfsId::new("00AA").unwrap()),
        Some(ReplicaState::Cached)
    );
    assert_eq!(
        repository.state(&PnfsId::new("00BB").unwrap()),
        Some(ReplicaState::Precious)
    );
    // Files unknown to the name space belong to deleted files
    assert!(!data_dir.join("00CC").exists());
    assert!(data_dir.join("notes.txt").exists());
    assert_eq!(repository.account().used(), 120);
}

#[tokio::test]
async fn test_interrupted_transfers_are_resolved() {
    let dir = TempDir::new().unwrap();
    {
        let repository = open_repository(dir.path());
        add_interrupted(&repository, "0101", 100, ReplicaState::ReceivingFromClient);
        add_interrupted(&repository, "0102", 100, ReplicaState::ReceivingFromClient);
        add_interrupted(&repository, "0103", 100, ReplicaState::ReceivingFromStore);
    }

    let namespace = MemoryNameSpace::new();
    namespace.insert(attributes("0101", 100));
    namespace.insert(attributes("0102", 999));
    namespace.insert(attributes("0103", 100));

    let repository = open_repository(dir.path());
    let report = repository.load(&namespace).await.unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.removed, 2);

    // A complete upload is kept for flushing
    assert_eq!(
        repository.state(&PnfsId::new("0101").unwrap()),
        Some(ReplicaState::Precious)
    );
    assert!(!repository.contains(&PnfsId::new("0102").unwrap()));
    assert!(!repository.contains(&PnfsId::new("0103").unwrap()));
    assert!(!repository.data_file(&PnfsId::new("0103").unwrap()).exists());
    assert_eq!(repository.account().used(), 100);
}

#[tokio::test]
async fn test_upload_of_unsized_file_sets_name_space_size() {
    let dir = TempDir::new().unwrap();
    {
        let repository = open_repository(dir.path());
        add_interrupted(&repository, "0201", 64, ReplicaState::ReceivingFromClient);
    }

    let namespace = MemoryNameSpace::new();
    namespace.insert(attributes("0201", 0));

    let repository = open_repository(dir.path());
    let report = repository.load(&namespace).await.unwrap();
    assert_eq!(report.loaded, 1);

    let id = PnfsId::new("0201").unwrap();
    assert_eq!(namespace.get(&id).unwrap().size, 64);
    assert_eq!(repository.get_entry(&id).unwrap().size, 64);
}
