//! End-to-end transfer scenarios across the vault, queues and transports

use msgvault::transport::{Credential, CredentialPool, MemoryTransport, SharedCredentialPool};
use msgvault::{
    EngineConfig, FileManifest, JsonFileMetadataStore, MemoryMetadataStore, MetadataStore,
    QueueConfig, RetryPolicy, StoredContent, TaskId, TaskStatus, TransferTask, Vault,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

fn engine(dir: &Path, chunk_size: usize, parallelism: usize) -> EngineConfig {
    EngineConfig::default()
        .with_chunk_size(chunk_size as u64)
        .with_chunk_parallelism(parallelism)
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
        .with_queue(QueueConfig {
            tick_interval: Duration::from_millis(10),
            eviction_delay: Duration::from_millis(100),
            ..QueueConfig::default()
        })
        .with_temp_dir(dir.join("tmp"))
}

fn pool(ids: &[&str]) -> SharedCredentialPool {
    SharedCredentialPool::new(
        ids.iter()
            .map(|id| Credential::new(*id, format!("{}-token", id)))
            .collect::<CredentialPool>(),
    )
}

fn open(
    config: EngineConfig,
    transport: &MemoryTransport,
    store: Arc<dyn MetadataStore>,
    credentials: &[&str],
) -> Vault {
    let vault = Vault::new(config, Arc::new(transport.clone()), store, pool(credentials)).unwrap();
    vault.start();
    vault
}

fn write_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 253) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

async fn wait_for_chunks(vault: &Vault, task_id: &TaskId, done: usize) {
    let mut progress = vault.progress(task_id).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        progress.wait_for(|state| state.completed.len() >= done),
    )
    .await
    .unwrap()
    .unwrap();
}

async fn download_and_compare(vault: &Vault, manifest: &FileManifest, dir: &Path, data: &[u8]) {
    let dest = dir.join(format!("restored-{}", manifest.file_id));
    let task = vault.enqueue_download(&manifest.file_id, &dest).await.unwrap();
    assert_eq!(vault.wait(&task).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[test_log::test(tokio::test)]
async fn test_ten_mib_file_rotates_credentials_and_deletes_every_object() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let vault = open(
        engine(dir.path(), 4 * MIB, 4),
        &transport,
        Arc::new(MemoryMetadataStore::new()),
        &["bot-0", "bot-1", "bot-2"],
    );
    let (path, data) = write_file(dir.path(), "video.mp4", 10 * MIB);

    let submitted = vault.enqueue_upload(&path).await.unwrap();
    vault.wait(&submitted.task_id.unwrap()).await.unwrap();
    let manifest = vault.manifest(&submitted.file_id).await.unwrap();

    let StoredContent::Chunked { chunks, .. } = &manifest.content else {
        panic!("expected chunked layout");
    };
    let owners: Vec<_> = chunks
        .iter()
        .map(|c| c.uploader_credential_id.as_str())
        .collect();
    assert_eq!(owners, vec!["bot-0", "bot-1", "bot-2"]);
    let sizes: Vec<_> = chunks.iter().map(|c| c.size).collect();
    assert_eq!(sizes, vec![4 * MIB as u64, 4 * MIB as u64, 2 * MIB as u64]);
    for chunk in chunks {
        assert_eq!(
            transport.owner_of(&chunk.remote_object_id),
            Some(chunk.uploader_credential_id.clone())
        );
    }

    download_and_compare(&vault, &manifest, dir.path(), &data).await;

    vault.delete_file(&submitted.file_id).await.unwrap();
    assert!(transport.is_empty());
    assert!(vault.manifest(&submitted.file_id).await.is_err());
    vault.shutdown();
}

#[tokio::test]
async fn test_pause_then_resume_stores_only_the_remaining_chunks() {
    let dir = tempfile::tempdir().unwrap();
    // two stores go through, the third blocks until released
    let transport = MemoryTransport::new().with_store_gate(2);
    let vault = open(
        engine(dir.path(), KIB, 1),
        &transport,
        Arc::new(MemoryMetadataStore::new()),
        &["a", "b"],
    );
    let (path, data) = write_file(dir.path(), "doc.bin", 5 * KIB);

    let submitted = vault.enqueue_upload(&path).await.unwrap();
    let task_id = submitted.task_id.unwrap();
    wait_for_chunks(&vault, &task_id, 2).await;

    vault.pause(&task_id).await.unwrap();
    let paused = vault.task(&task_id).await.unwrap();
    assert_eq!(paused.status, TaskStatus::Paused);
    assert_eq!(paused.completed_chunks.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(transport.store_calls(), 2);

    transport.release_stores(16);
    vault.resume(&task_id).await.unwrap();
    let done = vault.wait(&task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 1.0);
    assert_eq!(transport.store_calls(), 5);
    assert_eq!(transport.len(), 5);

    let manifest = vault.manifest(&submitted.file_id).await.unwrap();
    download_and_compare(&vault, &manifest, dir.path(), &data).await;
    vault.shutdown();
}

#[tokio::test]
async fn test_progress_events_never_decrease() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let vault = open(
        engine(dir.path(), KIB, 3),
        &transport,
        Arc::new(MemoryMetadataStore::new()),
        &["a", "b", "c"],
    );
    let mut events = vault.subscribe();
    let (path, _) = write_file(dir.path(), "log.txt", 9 * KIB + 17);

    let task_id = vault.enqueue_upload(&path).await.unwrap().task_id.unwrap();
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if event.task_id != task_id {
            continue;
        }
        seen.push(event.progress);
        if event.status == TaskStatus::Completed {
            break;
        }
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
    assert_eq!(seen.last().copied(), Some(1.0));
    let task = vault.task(&task_id).await.unwrap();
    assert_eq!(task.completed_chunks.len() as u32, task.total_chunks);
    vault.shutdown();
}

#[tokio::test]
async fn test_restart_restores_interrupted_upload() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = dir.path().join("metadata");
    let transport = MemoryTransport::new().with_store_gate(2);
    let (path, data) = write_file(dir.path(), "archive.tar", 4 * KIB + 100);

    let first = open(
        engine(dir.path(), KIB, 1),
        &transport,
        Arc::new(JsonFileMetadataStore::open(&metadata).await.unwrap()),
        &["a", "b"],
    );
    let submitted = first.enqueue_upload(&path).await.unwrap();
    let task_id = submitted.task_id.unwrap();
    wait_for_chunks(&first, &task_id, 2).await;
    first.shutdown();
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.release_stores(16);
    let store = Arc::new(JsonFileMetadataStore::open(&metadata).await.unwrap());
    let interrupted = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(interrupted.completed_chunks.len(), 2);

    let second = open(engine(dir.path(), KIB, 1), &transport, store, &["a", "b"]);
    assert_eq!(second.restore().await.unwrap(), 1);
    let done = second.wait(&task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(transport.store_calls(), 5);
    assert!(second.incomplete_tasks().await.unwrap().is_empty());

    let manifest = second.manifest(&submitted.file_id).await.unwrap();
    download_and_compare(&second, &manifest, dir.path(), &data).await;
    second.shutdown();
}

#[tokio::test]
async fn test_restored_ledger_skips_recorded_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
    let (path, data) = write_file(dir.path(), "photo.raw", 5 * KIB);

    // an earlier run stored every chunk; keep the refs for 0, 2 and 4
    let seeder = open(engine(dir.path(), KIB, 2), &transport, store.clone(), &["a", "b"]);
    let seeded = seeder.enqueue_upload(&path).await.unwrap();
    seeder.wait(&seeded.task_id.unwrap()).await.unwrap();
    let earlier = seeder.manifest(&seeded.file_id).await.unwrap();
    seeder.shutdown();

    let mut task = TransferTask::upload(
        msgvault::FileId::new(),
        path,
        "photo.raw".into(),
        5 * KIB as u64,
        KIB as u64,
        false,
        0,
    )
    .unwrap();
    let StoredContent::Chunked { chunks, .. } = &earlier.content else {
        panic!("expected chunked layout");
    };
    for chunk in chunks.iter().filter(|c| c.chunk_index % 2 == 0) {
        task.completed_chunks.insert(chunk.chunk_index);
        task.uploaded_refs.insert(chunk.chunk_index, chunk.clone());
    }
    task.status = TaskStatus::Running;
    store.put_task(&task).await.unwrap();
    let before = transport.store_calls();

    let vault = open(engine(dir.path(), KIB, 2), &transport, store, &["a", "b"]);
    assert_eq!(vault.restore().await.unwrap(), 1);
    vault.wait(&task.id).await.unwrap();
    assert_eq!(transport.store_calls() - before, 2);

    let resumed = vault.manifest(&task.file_id).await.unwrap();
    let StoredContent::Chunked { chunks: resumed_chunks, .. } = &resumed.content else {
        panic!("expected chunked layout");
    };
    for index in [0usize, 2, 4] {
        assert_eq!(resumed_chunks[index], chunks[index]);
    }
    assert_eq!(resumed.checksum, earlier.checksum);
    download_and_compare(&vault, &resumed, dir.path(), &data).await;
    vault.shutdown();
}

#[tokio::test]
async fn test_cancelled_upload_leaves_no_objects_or_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new().with_store_gate(1);
    let vault = open(
        engine(dir.path(), KIB, 1),
        &transport,
        Arc::new(MemoryMetadataStore::new()),
        &["a"],
    );
    let (path, _) = write_file(dir.path(), "big.bin", 3 * KIB);

    let task_id = vault.enqueue_upload(&path).await.unwrap().task_id.unwrap();
    wait_for_chunks(&vault, &task_id, 1).await;
    vault.cancel(&task_id).await.unwrap();
    let cancelled = vault.wait(&task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !transport.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(vault.list_files().await.unwrap().is_empty());
    vault.shutdown();
}
