//! Share-link containers exchanged between independent vaults

use msgvault::crypto::{CompatProfile, CryptoError, ShareLinkCodec};
use msgvault::transport::{Credential, CredentialPool, MemoryTransport, SharedCredentialPool};
use msgvault::{
    CoreError, EngineConfig, FileId, MemoryMetadataStore, QueueConfig, RetryPolicy, StoredContent,
    TaskStatus, Vault,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn vault(dir: &Path, transport: &MemoryTransport, credentials: &[&str], compat: CompatProfile) -> Vault {
    let config = EngineConfig::default()
        .with_chunk_size(1024)
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
        .with_queue(QueueConfig {
            tick_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        })
        .with_temp_dir(dir.join("tmp"))
        .with_compat(compat);
    let pool: CredentialPool = credentials
        .iter()
        .map(|id| Credential::new(*id, format!("{}-secret", id)))
        .collect();
    let vault = Vault::new(
        config,
        Arc::new(transport.clone()),
        Arc::new(MemoryMetadataStore::new()),
        SharedCredentialPool::new(pool),
    )
    .unwrap();
    vault.start();
    vault
}

fn write_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 13 % 241) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

async fn store(vault: &Vault, path: &Path) -> FileId {
    let submitted = vault.enqueue_upload(path).await.unwrap();
    if let Some(task) = submitted.task_id {
        assert_eq!(vault.wait(&task).await.unwrap().status, TaskStatus::Completed);
    }
    submitted.file_id
}

#[test_log::test(tokio::test)]
async fn test_batch_share_with_chunked_and_direct_file() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let sender = vault(dir.path(), &transport, &["a", "b", "c"], CompatProfile::V2);
    let (movie, movie_bytes) = write_file(dir.path(), "movie.mkv", 2600);
    let (note, note_bytes) = write_file(dir.path(), "note.txt", 300);
    let ids = vec![store(&sender, &movie).await, store(&sender, &note).await];

    let container = sender.export_share(&ids, "correct horse").await.unwrap();

    let manifest = ShareLinkCodec::new(CompatProfile::V2)
        .decode(&container, "correct horse")
        .unwrap();
    assert!(manifest.is_batch());
    let files = manifest.files();
    assert_eq!(files.len(), 2);
    assert!(files[0].is_chunked);
    assert_eq!(files[0].chunk_count(), 3);
    assert!(!files[1].is_chunked);
    assert!(files[1].chunks.is_none());
    assert!(files[1].message_id.is_some());

    // the recipient has no credentials of its own
    let recipient_dir = tempfile::tempdir().unwrap();
    let recipient = vault(recipient_dir.path(), &transport, &[], CompatProfile::V2);
    let imported = recipient.import_share(&container, "correct horse").await.unwrap();
    assert_eq!(imported.len(), 2);
    assert!(matches!(imported[0].content, StoredContent::Chunked { ref chunks, .. } if chunks.len() == 3));
    assert!(matches!(imported[1].content, StoredContent::Single { .. }));
    assert!(imported.iter().all(|m| !ids.contains(&m.file_id)));

    for (manifest, expected) in imported.iter().zip([&movie_bytes, &note_bytes]) {
        let dest = recipient_dir.path().join(&manifest.file_name);
        let task = recipient.enqueue_download(&manifest.file_id, &dest).await.unwrap();
        assert_eq!(recipient.wait(&task).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(&std::fs::read(&dest).unwrap(), expected);
    }
    sender.shutdown();
    recipient.shutdown();
}

#[tokio::test]
async fn test_wrong_passphrase_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let sender = vault(dir.path(), &transport, &["a"], CompatProfile::V2);
    let (path, _) = write_file(dir.path(), "secret.pdf", 500);
    let id = store(&sender, &path).await;
    let container = sender.export_share(&[id], "right").await.unwrap();

    for attempt in ["wrong", "", "right "] {
        let err = sender.import_share(&container, attempt).await.unwrap_err();
        assert!(
            matches!(err, CoreError::Crypto(CryptoError::WrongPasswordOrCorrupt)),
            "{:?} accepted or misreported: {}",
            attempt,
            err
        );
    }

    let mut damaged = container.clone();
    let last = damaged.len() - 1;
    damaged[last] ^= 0x55;
    assert!(matches!(
        sender.import_share(&damaged, "right").await,
        Err(CoreError::Crypto(CryptoError::WrongPasswordOrCorrupt))
    ));
    assert_eq!(sender.list_files().await.unwrap().len(), 1);
    sender.shutdown();
}

#[tokio::test]
async fn test_v1_profile_shares_single_files_only() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MemoryTransport::new();
    let sender = vault(dir.path(), &transport, &["a"], CompatProfile::V1);
    let (first, _) = write_file(dir.path(), "one.bin", 100);
    let (second, _) = write_file(dir.path(), "two.bin", 100);
    let ids = vec![store(&sender, &first).await, store(&sender, &second).await];

    let err = sender.export_share(&ids, "pw").await.unwrap_err();
    assert!(matches!(err, CoreError::Crypto(CryptoError::ProfileMismatch { .. })));

    let container = sender.export_share(&ids[..1], "pw").await.unwrap();
    let manifest = ShareLinkCodec::new(CompatProfile::V2)
        .decode(&container, "pw")
        .unwrap();
    assert_eq!(manifest.version, 1);
    assert!(!manifest.is_batch());
    sender.shutdown();
}
