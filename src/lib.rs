//! # msgvault
//!
//! File storage on top of a messaging backend that holds one size-limited
//! attachment per message.
//!
//! The engine lives in three crates, re-exported here:
//! - [`crypto`]: checksums and the share-link container
//! - [`transport`]: remote objects, credentials and chunking
//! - the transfer engine itself, at the crate root

pub use msgvault_core::*;
pub use msgvault_crypto as crypto;
pub use msgvault_transport as transport;
