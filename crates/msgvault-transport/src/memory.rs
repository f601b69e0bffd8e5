//! In-memory transport for testing

use crate::{
    check_payload, BlobProgress, Credential, CredentialId, RemoteObjectId, RemoteTransport,
    Result, TransportError, DEFAULT_MAX_PAYLOAD,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Clone, Debug)]
struct StoredObject {
    owner: CredentialId,
    data: Bytes,
}

/// An in-memory transport with credential-scoped objects and fault injection
#[derive(Clone)]
pub struct MemoryTransport {
    objects: Arc<DashMap<RemoteObjectId, StoredObject>>,
    next_id: Arc<AtomicU64>,
    max_payload: usize,
    store_calls: Arc<AtomicUsize>,
    retrieve_calls: Arc<AtomicUsize>,
    fail_stores: Arc<AtomicUsize>,
    fail_retrieves: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
    store_gate: Option<Arc<Semaphore>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create an empty transport with the default payload limit
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create an empty transport with a custom payload limit
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            max_payload,
            store_calls: Arc::new(AtomicUsize::new(0)),
            retrieve_calls: Arc::new(AtomicUsize::new(0)),
            fail_stores: Arc::new(AtomicUsize::new(0)),
            fail_retrieves: Arc::new(AtomicUsize::new(0)),
            delay: Arc::new(Mutex::new(None)),
            store_gate: None,
        }
    }

    /// Make every store wait for a permit; starts with `permits` available
    pub fn with_store_gate(mut self, permits: usize) -> Self {
        self.store_gate = Some(Arc::new(Semaphore::new(permits)));
        self
    }

    /// Allow `n` more gated stores to proceed
    pub fn release_stores(&self, n: usize) {
        if let Some(gate) = &self.store_gate {
            gate.add_permits(n);
        }
    }

    /// Fail the next `n` store calls with a connection error
    pub fn fail_next_stores(&self, n: usize) {
        self.fail_stores.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` retrieve calls with a connection error
    pub fn fail_next_retrieves(&self, n: usize) {
        self.fail_retrieves.store(n, Ordering::SeqCst);
    }

    /// Delay every operation by `delay`
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of successful stores
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Number of successful retrieves
    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    /// Number of objects held
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no objects are held
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether an object exists
    pub fn contains(&self, object_id: &RemoteObjectId) -> bool {
        self.objects.contains_key(object_id)
    }

    /// Owner of an object
    pub fn owner_of(&self, object_id: &RemoteObjectId) -> Option<CredentialId> {
        self.objects.get(object_id).map(|o| o.owner.clone())
    }

    /// Drop an object behind the engine's back
    pub fn purge(&self, object_id: &RemoteObjectId) -> bool {
        self.objects.remove(object_id).is_some()
    }

    /// Flip the first byte of a stored object
    pub fn corrupt(&self, object_id: &RemoteObjectId) -> bool {
        let Some(mut object) = self.objects.get_mut(object_id) else {
            return false;
        };
        let mut data = object.data.to_vec();
        if let Some(first) = data.first_mut() {
            *first ^= 0xff;
        }
        object.data = Bytes::from(data);
        true
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn authorize(&self, credential: &Credential, object_id: &RemoteObjectId) -> Result<Bytes> {
        let object = self
            .objects
            .get(object_id)
            .ok_or_else(|| TransportError::NotFound {
                object_id: object_id.to_string(),
            })?;
        if object.owner != credential.id {
            return Err(TransportError::Unauthorized {
                credential_id: credential.id.to_string(),
                object_id: object_id.to_string(),
            });
        }
        Ok(object.data.clone())
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    fn max_payload_size(&self) -> usize {
        self.max_payload
    }

    async fn store_blob(&self, credential: &Credential, payload: Bytes) -> Result<RemoteObjectId> {
        check_payload(payload.len(), self.max_payload)?;
        if let Some(gate) = &self.store_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            permit.forget();
        }
        self.pause().await;
        if Self::take_fault(&self.fail_stores) {
            return Err(TransportError::Connection("injected store failure".to_string()));
        }

        let id = RemoteObjectId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        self.objects.insert(
            id.clone(),
            StoredObject {
                owner: credential.id.clone(),
                data: payload,
            },
        );
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn retrieve_blob(
        &self,
        credential: &Credential,
        object_id: &RemoteObjectId,
        progress: Option<BlobProgress<'_>>,
    ) -> Result<Bytes> {
        self.pause().await;
        if Self::take_fault(&self.fail_retrieves) {
            return Err(TransportError::Connection("injected retrieve failure".to_string()));
        }
        let data = self.authorize(credential, object_id)?;
        if let Some(progress) = progress {
            progress(data.len() as u64, data.len() as u64);
        }
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(data)
    }

    async fn delete_object(
        &self,
        credential: &Credential,
        object_id: &RemoteObjectId,
    ) -> Result<bool> {
        self.pause().await;
        match self.authorize(credential, object_id) {
            Ok(_) => Ok(self.objects.remove(object_id).is_some()),
            Err(TransportError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
