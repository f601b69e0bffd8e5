//! # msgvault CLI
//!
//! Command-line client for msgvault. Files are stored in a directory-backed
//! remote under the configured data directory, with manifests and task
//! records kept alongside so interrupted transfers can be resumed.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      msgvault <command> [options]       │
//! ├─────────────────────────────────────────┤
//! │  CliConfig (defaults < file < env)      │
//! ├─────────────────────────────────────────┤
//! │           msgvault-core Vault           │
//! ├─────────────────────────────────────────┤
//! │ DirectoryTransport │ JsonFileMetadata   │
//! └─────────────────────────────────────────┘
//! ```

pub mod commands;
pub mod config;
pub mod error;

pub use config::CliConfig;
pub use error::{CliError, Result};
