//! Remote store interfaces and the in-memory store used by tests.
//!
//! The scheduler core only ever talks to a store through [`StoreBinder`]
//! and [`StoreClient`]; production bindings live with the transport layer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{WritebackError, WritebackResult};
use crate::location::{Endpoint, Reference};

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Server response to a put: the reference the store computed for the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refdata {
    /// Content reference as computed by the store.
    pub reference: Reference,
}

/// Client for one remote content-addressed store.
pub trait StoreClient: Send + Sync {
    /// Upload bytes; the store answers with the reference it computed.
    fn put(&self, data: Vec<u8>) -> BoxFuture<'_, WritebackResult<Refdata>>;
}

/// Resolves an endpoint to a store client.
pub trait StoreBinder: Send + Sync {
    /// Bind `endpoint` to a usable client. A bind failure counts as a
    /// writeback failure for the request that needed it.
    fn bind(&self, endpoint: &Endpoint) -> WritebackResult<Arc<dyn StoreClient>>;
}

/// Counters for the mock store.
#[derive(Debug, Clone, Default)]
pub struct MockStoreStats {
    /// Number of put calls, including failed ones.
    pub puts: u64,
    /// Total bytes accepted.
    pub bytes_put: u64,
}

/// In-memory content-addressed store for tests.
///
/// `put` hashes the bytes to produce the returned reference, so a cached
/// file whose content does not match its submitted reference surfaces as a
/// reference mismatch exactly the way a real store reports one.
pub struct MockStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    scripted_errors: Mutex<VecDeque<String>>,
    delay: Mutex<Option<Duration>>,
    stats: Mutex<MockStoreStats>,
}

impl MockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            scripted_errors: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            stats: Mutex::new(MockStoreStats::default()),
        }
    }

    /// The reference this store computes for `data`.
    pub fn reference_for(data: &[u8]) -> Reference {
        let digest = Sha256::digest(data);
        Reference::new(
            digest
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>(),
        )
    }

    /// Queue an error message for an upcoming put; scripted errors are
    /// consumed in order, one per put.
    pub fn push_error(&self, message: impl Into<String>) {
        self.scripted_errors
            .lock()
            .unwrap()
            .push_back(message.into());
    }

    /// Delay every subsequent put by `delay` before it completes.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Whether an object with this reference has been stored.
    pub fn contains(&self, reference: &Reference) -> bool {
        self.objects.lock().unwrap().contains_key(reference.as_str())
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Snapshot of the store's counters.
    pub fn stats(&self) -> MockStoreStats {
        self.stats.lock().unwrap().clone()
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreClient for MockStore {
    fn put(&self, data: Vec<u8>) -> BoxFuture<'_, WritebackResult<Refdata>> {
        let delay = *self.delay.lock().unwrap();
        let scripted = self.scripted_errors.lock().unwrap().pop_front();
        self.stats.lock().unwrap().puts += 1;

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = scripted {
                return Err(WritebackError::Put(message));
            }
            let reference = Self::reference_for(&data);
            let bytes = data.len() as u64;
            self.objects
                .lock()
                .unwrap()
                .insert(reference.as_str().to_string(), data);
            self.stats.lock().unwrap().bytes_put += bytes;
            Ok(Refdata { reference })
        })
    }
}

/// Binder handing out one [`MockStore`] per endpoint, created on first use.
pub struct MockStoreBinder {
    stores: Mutex<HashMap<Endpoint, Arc<MockStore>>>,
    refused: Mutex<HashSet<Endpoint>>,
}

impl MockStoreBinder {
    /// Create a binder with no stores yet.
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
        }
    }

    /// The store serving `endpoint`, created if needed.
    pub fn store_for(&self, endpoint: &Endpoint) -> Arc<MockStore> {
        Arc::clone(
            self.stores
                .lock()
                .unwrap()
                .entry(endpoint.clone())
                .or_insert_with(|| Arc::new(MockStore::new())),
        )
    }

    /// Make [`StoreBinder::bind`] fail for `endpoint`.
    pub fn refuse(&self, endpoint: &Endpoint) {
        self.refused.lock().unwrap().insert(endpoint.clone());
    }

    /// Let `endpoint` bind again.
    pub fn allow(&self, endpoint: &Endpoint) {
        self.refused.lock().unwrap().remove(endpoint);
    }
}

impl Default for MockStoreBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBinder for MockStoreBinder {
    fn bind(&self, endpoint: &Endpoint) -> WritebackResult<Arc<dyn StoreClient>> {
        if self.refused.lock().unwrap().contains(endpoint) {
            return Err(WritebackError::Bind {
                endpoint: endpoint.to_string(),
                reason: "refused by test binder".to_string(),
            });
        }
        Ok(self.store_for(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Transport;

    #[tokio::test]
    async fn test_put_returns_content_reference() {
        let store = MockStore::new();
        let refdata = store.put(b"some bytes".to_vec()).await.unwrap();
        assert_eq!(refdata.reference, MockStore::reference_for(b"some bytes"));
        assert!(store.contains(&refdata.reference));

        let stats = store.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.bytes_put, 10);
    }

    #[tokio::test]
    async fn test_scripted_errors_consumed_in_order() {
        let store = MockStore::new();
        store.push_error("request timeout");
        store.push_error("connection refused");

        let first = store.put(b"x".to_vec()).await.unwrap_err();
        assert!(first.is_timeout());
        let second = store.put(b"x".to_vec()).await.unwrap_err();
        assert!(!second.is_timeout());
        assert!(store.put(b"x".to_vec()).await.is_ok());
        assert_eq!(store.object_count(), 1);
    }

    #[test]
    fn test_binder_one_store_per_endpoint() {
        let binder = MockStoreBinder::new();
        let e1 = Endpoint::new(Transport::Remote, "a:1");
        let e2 = Endpoint::new(Transport::Remote, "b:1");

        let first = binder.store_for(&e1);
        let again = binder.store_for(&e1);
        let other = binder.store_for(&e2);
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_binder_refuse_and_allow() {
        let binder = MockStoreBinder::new();
        let ep = Endpoint::new(Transport::Remote, "a:1");

        binder.refuse(&ep);
        assert!(matches!(
            binder.bind(&ep),
            Err(WritebackError::Bind { .. })
        ));

        binder.allow(&ep);
        assert!(binder.bind(&ep).is_ok());
    }
}
