//! Command implementations

use crate::{
    config::CliConfig,
    error::{CliError, Result},
};
use msgvault_core::{
    Direction, FileId, FileManifest, JsonFileMetadataStore, StoredContent, TaskId, TaskStatus,
    TransferTask, Vault,
};
use msgvault_transport::{DirectoryTransport, SharedCredentialPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Open the vault described by `config`, with schedulers running
pub async fn open_vault(config: &CliConfig) -> Result<Vault> {
    let transport = DirectoryTransport::open(config.remote_dir())
        .await
        .map_err(msgvault_core::CoreError::from)?;
    let store = JsonFileMetadataStore::open(config.metadata_dir()).await?;
    let pool = config.credential_pool()?;
    debug!(data_dir = %config.data_dir.display(), credentials = pool.len(), "Opening vault");

    let vault = Vault::new(
        config.engine(),
        Arc::new(transport),
        Arc::new(store),
        SharedCredentialPool::new(pool),
    )?;
    vault.start();
    Ok(vault)
}

fn require_credentials(vault: &Vault) -> Result<()> {
    if vault.credentials().snapshot().is_empty() {
        return Err(CliError::NoCredentials);
    }
    Ok(())
}

/// Wait for a task and turn anything but COMPLETED into an error
async fn settle(vault: &Vault, task_id: &TaskId) -> Result<TransferTask> {
    let task = vault.wait(task_id).await?;
    if task.status != TaskStatus::Completed {
        return Err(CliError::TaskFailed {
            task_id: task_id.to_string(),
            status: task.status.to_string(),
            message: task.error.clone().unwrap_or_default(),
        });
    }
    Ok(task)
}

/// Log progress events until the returned handle is aborted
fn report_progress(vault: &Vault) -> tokio::task::JoinHandle<()> {
    let mut events = vault.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    task_id = %event.task_id,
                    direction = %event.direction,
                    status = %event.status,
                    progress = format_args!("{:.0}%", event.progress * 100.0),
                    "Transfer update"
                ),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Store files
pub async fn upload(vault: &Vault, paths: &[PathBuf]) -> Result<Vec<FileId>> {
    require_credentials(vault)?;
    let reporter = report_progress(vault);
    let mut submitted = Vec::with_capacity(paths.len());
    for path in paths {
        submitted.push((path, vault.enqueue_upload(path).await?));
    }

    let mut stored = Vec::with_capacity(submitted.len());
    for (path, upload) in submitted {
        if let Some(task_id) = upload.task_id {
            settle(vault, &task_id).await?;
        }
        println!("{}\t{}", upload.file_id, path.display());
        stored.push(upload.file_id);
    }
    reporter.abort();
    Ok(stored)
}

/// Fetch a file into `dest`
pub async fn download(vault: &Vault, file_id: &str, dest: &Path) -> Result<()> {
    let file_id: FileId = file_id.parse()?;
    let reporter = report_progress(vault);
    let task_id = vault.enqueue_download(&file_id, dest).await?;
    let result = settle(vault, &task_id).await;
    reporter.abort();
    result?;
    println!("{}", dest.display());
    Ok(())
}

/// Delete a file and its remote objects
pub async fn delete(vault: &Vault, file_id: &str) -> Result<()> {
    let file_id: FileId = file_id.parse()?;
    vault.delete_file(&file_id).await?;
    println!("deleted {}", file_id);
    Ok(())
}

/// Print stored files
pub async fn list(vault: &Vault) -> Result<()> {
    let files = vault.list_files().await?;
    for file in &files {
        println!("{}", describe(file));
    }
    if files.is_empty() {
        println!("no files stored");
    }
    Ok(())
}

fn describe(file: &FileManifest) -> String {
    let layout = match &file.content {
        StoredContent::Empty => "empty".to_string(),
        StoredContent::Single { .. } => "single".to_string(),
        StoredContent::Chunked { chunks, .. } => format!("{} chunks", chunks.len()),
    };
    format!(
        "{}\t{}\t{} bytes\t{}\t{}\t{}",
        file.file_id,
        file.file_name,
        file.total_size,
        file.mime_type,
        layout,
        file.created_at.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Print incomplete transfers
pub async fn tasks(vault: &Vault) -> Result<()> {
    let pending = vault.incomplete_tasks().await?;
    for task in &pending {
        println!(
            "{}\t{}\t{}\t{:.0}%\t{}/{} chunks\t{}{}",
            task.id,
            task.direction,
            task.status,
            task.progress * 100.0,
            task.completed_chunks.len(),
            task.total_chunks,
            task.file_name,
            task.error
                .as_deref()
                .map(|e| format!("\t{}", e))
                .unwrap_or_default()
        );
    }
    if pending.is_empty() {
        println!("no incomplete tasks");
    }
    Ok(())
}

/// Re-queue every incomplete transfer and wait for all of them
pub async fn resume(vault: &Vault) -> Result<()> {
    let restored = vault.restore().await?;
    if restored == 0 {
        println!("nothing to resume");
        return Ok(());
    }
    let pending = vault.tasks().await;
    if pending.iter().any(|t| t.direction == Direction::Upload) {
        require_credentials(vault)?;
    }
    for task in &pending {
        if matches!(task.status, TaskStatus::Paused | TaskStatus::Failed) {
            vault.resume(&task.id).await?;
        }
    }

    let reporter = report_progress(vault);
    let mut failures = 0;
    for task in vault.tasks().await {
        match settle(vault, &task.id).await {
            Ok(done) => println!("{}\t{}\t{}", done.id, done.direction, done.file_name),
            Err(e) => {
                eprintln!("{}: {}", task.id, e);
                failures += 1;
            }
        }
    }
    reporter.abort();
    if failures > 0 {
        return Err(CliError::TaskFailed {
            task_id: format!("{} of {}", failures, restored),
            status: TaskStatus::Failed.to_string(),
            message: "resume incomplete".to_string(),
        });
    }
    Ok(())
}

/// Write a share-link container for stored files
pub async fn share_export(
    vault: &Vault,
    file_ids: &[String],
    out: &Path,
    passphrase: Option<&str>,
    armored: bool,
) -> Result<()> {
    let passphrase = passphrase.ok_or(CliError::MissingPassphrase)?;
    let ids = file_ids
        .iter()
        .map(|id| id.parse())
        .collect::<std::result::Result<Vec<FileId>, _>>()?;
    let container = vault.export_share(&ids, passphrase).await?;
    if armored {
        tokio::fs::write(out, msgvault_crypto::armor(&container)).await?;
    } else {
        tokio::fs::write(out, &container).await?;
    }
    println!("{} ({} files, {} bytes)", out.display(), ids.len(), container.len());
    Ok(())
}

/// Record the files of a share-link container
pub async fn share_import(
    vault: &Vault,
    container: &Path,
    passphrase: Option<&str>,
    armored: bool,
) -> Result<()> {
    let passphrase = passphrase.ok_or(CliError::MissingPassphrase)?;
    let mut bytes = tokio::fs::read(container).await?;
    if armored {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        bytes = msgvault_crypto::dearmor(&text).map_err(msgvault_core::CoreError::from)?;
    }
    for manifest in vault.import_share(&bytes, passphrase).await? {
        println!("{}", describe(&manifest));
    }
    Ok(())
}

/// Write a sealed backup of every stored file record
pub async fn backup_export(vault: &Vault, out: &Path, passphrase: Option<&str>) -> Result<()> {
    let passphrase = passphrase.ok_or(CliError::MissingPassphrase)?;
    let sealed = vault.export_backup(passphrase).await?;
    tokio::fs::write(out, &sealed).await?;
    println!("{} ({} bytes)", out.display(), sealed.len());
    Ok(())
}

/// Restore file records from a sealed backup
pub async fn backup_import(vault: &Vault, archive: &Path, passphrase: Option<&str>) -> Result<()> {
    let passphrase = passphrase.ok_or(CliError::MissingPassphrase)?;
    let sealed = tokio::fs::read(archive).await?;
    let restored = vault.import_backup(&sealed, passphrase).await?;
    for manifest in &restored {
        println!("{}", describe(manifest));
    }
    if restored.is_empty() {
        println!("backup holds no files");
    }
    Ok(())
}
