//! Conversion between stored manifests and share-link manifests
//!
//! Exported records carry the token of every uploader so the recipient can
//! fetch the chunks without the sender's credential pool. Imported manifests
//! get fresh file ids and keep those tokens as embedded credentials.

use crate::{
    metadata::{FileId, FileManifest, RemoteChunkRef, StoredContent},
    CoreError, Result,
};
use chrono::{DateTime, Utc};
use msgvault_crypto::{checksum_hex, ShareManifest, SharedChunk, SharedFile};
use msgvault_transport::{Credential, CredentialId, CredentialPool, RemoteObjectId};

/// Build a share manifest: a single container for one file, a batch otherwise
pub fn export(manifests: &[FileManifest], pool: &CredentialPool) -> Result<ShareManifest> {
    let mut files = manifests
        .iter()
        .map(|m| to_shared(m, pool))
        .collect::<Result<Vec<_>>>()?;
    match files.len() {
        0 => Err(CoreError::InvalidInput("nothing to share".to_string())),
        1 => Ok(ShareManifest::single(files.remove(0))),
        _ => Ok(ShareManifest::batch(files)),
    }
}

/// Turn every record of a decoded share into a stored manifest
pub fn import(share: ShareManifest) -> Result<Vec<FileManifest>> {
    share.into_files().into_iter().map(from_shared).collect()
}

/// Share record of one stored file
pub fn to_shared(manifest: &FileManifest, pool: &CredentialPool) -> Result<SharedFile> {
    let mut file = SharedFile {
        file_name: manifest.file_name.clone(),
        file_size: manifest.total_size,
        mime_type: manifest.mime_type.clone(),
        is_chunked: false,
        message_id: None,
        uploader_id: None,
        uploader_token: None,
        chunk_size: None,
        chunks: None,
        checksum: manifest.checksum.clone(),
        created_at: Some(manifest.created_at.timestamp_millis()),
    };
    match &manifest.content {
        StoredContent::Empty => {}
        StoredContent::Single {
            remote_object_id,
            uploader_credential_id,
        } => {
            let credential = manifest.resolve_credential(uploader_credential_id, pool)?;
            file.message_id = Some(remote_object_id.as_str().to_string());
            file.uploader_id = Some(credential.id.as_str().to_string());
            file.uploader_token = Some(credential.token);
        }
        StoredContent::Chunked { chunk_size, chunks } => {
            let shared = chunks
                .iter()
                .map(|chunk| {
                    let credential =
                        manifest.resolve_credential(&chunk.uploader_credential_id, pool)?;
                    Ok(SharedChunk {
                        index: chunk.chunk_index,
                        message_id: chunk.remote_object_id.as_str().to_string(),
                        uploader_id: credential.id.as_str().to_string(),
                        uploader_token: credential.token,
                        size: chunk.size,
                        checksum: chunk.checksum.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            file.is_chunked = true;
            file.chunk_size = Some(*chunk_size);
            file.chunks = Some(shared);
        }
    }
    Ok(file)
}

/// Stored manifest of one share record, with a new file id
pub fn from_shared(file: SharedFile) -> Result<FileManifest> {
    let mut embedded: Vec<Credential> = Vec::new();
    let mut embed = |id: Option<&str>, token: &str| -> CredentialId {
        let credential = match id.filter(|id| !id.is_empty()) {
            Some(id) => Credential::new(id, token),
            None => Credential::new(derived_id(token), token),
        };
        let id = credential.id.clone();
        if !embedded.iter().any(|c| c.id == id) {
            embedded.push(credential);
        }
        id
    };

    let content = match (file.is_chunked, file.chunks) {
        (true, Some(chunks)) if !chunks.is_empty() => {
            let chunk_size = file.chunk_size.unwrap_or(chunks[0].size);
            let refs = chunks
                .into_iter()
                .map(|c| RemoteChunkRef {
                    chunk_index: c.index,
                    remote_object_id: RemoteObjectId::new(c.message_id),
                    uploader_credential_id: embed(Some(c.uploader_id.as_str()), &c.uploader_token),
                    size: c.size,
                    checksum: c.checksum,
                })
                .collect();
            StoredContent::Chunked {
                chunk_size,
                chunks: refs,
            }
        }
        _ if file.file_size == 0 => StoredContent::Empty,
        (false, _) => {
            let (Some(message_id), Some(token)) = (file.message_id, file.uploader_token) else {
                return Err(CoreError::InvalidInput(format!(
                    "{}: shared file has no message reference",
                    file.file_name
                )));
            };
            StoredContent::Single {
                remote_object_id: RemoteObjectId::new(message_id),
                uploader_credential_id: embed(file.uploader_id.as_deref(), &token),
            }
        }
        (true, _) => {
            return Err(CoreError::InvalidInput(format!(
                "{}: chunked file without chunks",
                file.file_name
            )))
        }
    };

    let mime_type = if file.mime_type.is_empty() {
        FileManifest::guess_mime(&file.file_name)
    } else {
        file.mime_type
    };
    let created_at = file
        .created_at
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let manifest = FileManifest {
        file_id: FileId::new(),
        file_name: file.file_name,
        total_size: file.file_size,
        mime_type,
        content,
        checksum: file.checksum,
        created_at,
        embedded_credentials: embedded,
    };
    manifest.validate()?;
    Ok(manifest)
}

/// Stable id for a shared token that arrived without one
fn derived_id(token: &str) -> String {
    format!("shared-{}", &checksum_hex(token.as_bytes())[..12])
}
