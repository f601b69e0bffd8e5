//! CLI configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `MSGVAULT_*` environment variables, then command-line flags.

use crate::error::{CliError, Result};
use msgvault_core::{EngineConfig, QueueConfig, RetryPolicy};
use msgvault_crypto::CompatProfile;
use msgvault_transport::{Credential, CredentialPool, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Root holding the local remote, metadata and temporary chunks
    pub data_dir: PathBuf,
    /// Upload identities as `id:token`, in rotation order
    pub credentials: Vec<String>,
    /// Chunk size in bytes
    pub chunk_size: u64,
    /// Simultaneous chunk operations per task
    pub chunk_parallelism: usize,
    /// Running tasks per queue
    pub max_running: usize,
    /// Attempts per chunk before a transfer fails
    pub max_attempts: u32,
    /// Share-link manifest revision
    pub compat: CompatProfile,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".msgvault"),
            credentials: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_parallelism: 4,
            max_running: 3,
            max_attempts: 3,
            compat: CompatProfile::default(),
        }
    }
}

impl CliConfig {
    /// Load defaults, then `file` if it exists, then the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&CliConfig::default())?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("MSGVAULT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("credentials"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Directory used as the remote backend
    pub fn remote_dir(&self) -> PathBuf {
        self.data_dir.join("remote")
    }

    /// Directory holding manifests and task records
    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// Directory holding temporary chunk files
    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// Parse the configured credentials
    pub fn credential_pool(&self) -> Result<CredentialPool> {
        self.credentials
            .iter()
            .map(|entry| parse_credential(entry))
            .collect::<Result<Vec<_>>>()
            .map(CredentialPool::new)
    }

    /// Engine settings derived from this configuration
    pub fn engine(&self) -> EngineConfig {
        let retry = RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ..RetryPolicy::default()
        };
        EngineConfig::default()
            .with_chunk_size(self.chunk_size)
            .with_chunk_parallelism(self.chunk_parallelism)
            .with_retry(retry)
            .with_queue(QueueConfig {
                max_running: self.max_running,
                ..QueueConfig::default()
            })
            .with_temp_dir(self.temp_dir())
            .with_compat(self.compat)
    }
}

/// Parse `id:token`
pub fn parse_credential(entry: &str) -> Result<Credential> {
    match entry.trim().split_once(':') {
        Some((id, token)) if !id.is_empty() && !token.is_empty() => Ok(Credential::new(id, token)),
        _ => Err(CliError::InvalidCredential(entry.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("bot-1:abc", "bot-1", "abc")]
    #[case(" bot-2:x:y ", "bot-2", "x:y")]
    fn test_parse_credential(#[case] entry: &str, #[case] id: &str, #[case] token: &str) {
        let credential = parse_credential(entry).unwrap();
        assert_eq!(credential.id.as_str(), id);
        assert_eq!(credential.token, token);
    }

    #[rstest]
    #[case("no-separator")]
    #[case(":token")]
    #[case("id:")]
    fn test_parse_credential_rejects(#[case] entry: &str) {
        assert!(matches!(parse_credential(entry), Err(CliError::InvalidCredential(_))));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgvault.toml");
        std::fs::write(
            &path,
            "data_dir = \"/var/lib/msgvault\"\nchunk_size = 1048576\ncredentials = [\"a:1\", \"b:2\"]\ncompat = \"v1\"\n",
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/msgvault"));
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.max_running, 3);
        assert_eq!(config.compat, CompatProfile::V1);
        assert_eq!(config.credential_pool().unwrap().len(), 2);

        let engine = config.engine();
        assert_eq!(engine.single_shot_threshold, 1024 * 1024);
        assert_eq!(engine.temp_dir, PathBuf::from("/var/lib/msgvault/tmp"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = CliConfig::load(Some(Path::new("/nonexistent/msgvault.toml"))).unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
