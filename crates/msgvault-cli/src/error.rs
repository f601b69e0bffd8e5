//! CLI error types

use msgvault_core::CoreError;
use thiserror::Error;

/// Result type alias using `CliError`
pub type Result<T> = std::result::Result<T, CliError>;

/// Errors surfaced by CLI commands
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Credential entry is not `id:token`
    #[error("invalid credential entry '{0}', expected id:token")]
    InvalidCredential(String),

    /// A command needs credentials and none are configured
    #[error("no credentials configured; set MSGVAULT_CREDENTIALS or add them to the config file")]
    NoCredentials,

    /// A share command needs a passphrase
    #[error("passphrase required; pass --passphrase or set MSGVAULT_PASSPHRASE")]
    MissingPassphrase,

    /// A transfer ended without completing
    #[error("task {task_id} ended {status}: {message}")]
    TaskFailed {
        task_id: String,
        status: String,
        message: String,
    },

    /// Engine error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::InvalidCredential(_) | Self::NoCredentials => 2,
            Self::MissingPassphrase => 2,
            Self::Core(CoreError::Crypto(_)) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::NoCredentials.exit_code(), 2);
        assert_eq!(
            CliError::Core(CoreError::Crypto(
                msgvault_crypto::CryptoError::WrongPasswordOrCorrupt
            ))
            .exit_code(),
            3
        );
        assert_eq!(CliError::Core(CoreError::Cancelled).exit_code(), 1);
    }
}
