//! Upload identities and round-robin assignment
//!
//! Retrieval on the remote backend is scoped to the credential that stored an
//! object, so every chunk reference remembers its uploader. The rotator is a
//! pure function of the chunk index, which lets resume and share export
//! re-derive an assignment, but callers still persist the credential actually
//! used because the pool may change between runs.

use crate::{Result, TransportError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identifier of a credential
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(String);

impl CredentialId {
    /// Create an id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialId({})", self.0)
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authorization token for remote transport operations
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identifier
    pub id: CredentialId,
    /// Secret token presented to the backend
    pub token: String,
}

impl Credential {
    /// Create a credential
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: CredentialId::new(id),
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// An immutable, cheaply cloned snapshot of credentials
#[derive(Clone, Debug, Default)]
pub struct CredentialPool {
    members: Arc<[Credential]>,
}

impl CredentialPool {
    /// Build a pool from credentials in rotation order
    pub fn new(members: Vec<Credential>) -> Self {
        Self {
            members: members.into(),
        }
    }

    /// Number of credentials
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the pool has no credentials
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Credentials in rotation order
    pub fn members(&self) -> &[Credential] {
        &self.members
    }

    /// Look up a credential by id
    pub fn get(&self, id: &CredentialId) -> Option<&Credential> {
        self.members.iter().find(|c| &c.id == id)
    }

    /// Look up a credential by id, failing if absent
    pub fn resolve(&self, id: &CredentialId) -> Result<&Credential> {
        self.get(id)
            .ok_or_else(|| TransportError::UnknownCredential(id.to_string()))
    }
}

impl FromIterator<Credential> for CredentialPool {
    fn from_iter<I: IntoIterator<Item = Credential>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Round-robin mapping from chunk index to credential
pub struct CredentialRotator;

impl CredentialRotator {
    /// `pool[chunk_index mod len(pool)]`
    pub fn assign(chunk_index: u32, pool: &CredentialPool) -> Result<&Credential> {
        Self::assign_with_offset(chunk_index, 0, pool)
    }

    /// Assignment shifted by a per-task base offset
    pub fn assign_with_offset(
        chunk_index: u32,
        offset: u32,
        pool: &CredentialPool,
    ) -> Result<&Credential> {
        if pool.is_empty() {
            return Err(TransportError::EmptyCredentialPool);
        }
        let slot = (u64::from(chunk_index) + u64::from(offset)) % pool.len() as u64;
        Ok(&pool.members()[slot as usize])
    }
}

/// A replaceable credential pool shared between tasks.
///
/// Dispatchers take a [`snapshot`](Self::snapshot) per chunk, so a replacement
/// only affects chunks that have not been dispatched yet.
#[derive(Clone, Debug, Default)]
pub struct SharedCredentialPool {
    inner: Arc<RwLock<CredentialPool>>,
}

impl SharedCredentialPool {
    /// Wrap an initial pool
    pub fn new(pool: CredentialPool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(pool)),
        }
    }

    /// Current pool
    pub fn snapshot(&self) -> CredentialPool {
        self.inner.read().clone()
    }

    /// Replace the pool for future dispatches
    pub fn replace(&self, pool: CredentialPool) {
        *self.inner.write() = pool;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool(n: usize) -> CredentialPool {
        (0..n)
            .map(|i| Credential::new(format!("bot-{}", i), format!("token-{}", i)))
            .collect()
    }

    #[test]
    fn test_empty_pool_is_fatal() {
        let pool = CredentialPool::default();
        let result = CredentialRotator::assign(0, &pool);
        assert!(matches!(result, Err(TransportError::EmptyCredentialPool)));
    }

    #[test]
    fn test_three_chunks_three_credentials() {
        let pool = pool(3);
        let ids: Vec<_> = (0..3)
            .map(|i| CredentialRotator::assign(i, &pool).unwrap().id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["bot-0", "bot-1", "bot-2"]);
    }

    #[test]
    fn test_offset_shifts_assignment() {
        let pool = pool(3);
        let cred = CredentialRotator::assign_with_offset(0, 2, &pool).unwrap();
        assert_eq!(cred.id.as_str(), "bot-2");
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", Credential::new("bot", "secret-token"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn test_shared_pool_replacement() {
        let shared = SharedCredentialPool::new(pool(1));
        let before = shared.snapshot();
        shared.replace(pool(4));
        assert_eq!(before.len(), 1);
        assert_eq!(shared.snapshot().len(), 4);
    }

    proptest! {
        #[test]
        fn prop_assign_is_modular(index in 0u32..100_000, n in 1usize..16) {
            let pool = pool(n);
            let first = CredentialRotator::assign(index, &pool).unwrap().clone();
            let again = CredentialRotator::assign(index, &pool).unwrap().clone();
            prop_assert_eq!(&first, &pool.members()[index as usize % n]);
            prop_assert_eq!(first, again);
        }
    }
}
