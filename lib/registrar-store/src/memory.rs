//! In-process store with etcd-like lease semantics

use crate::store::{Connector, KeepAliveAck, KeepAliveStream, KeyValue, KvStore, LeaseGrant, LeaseId};
use crate::{Result, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::debug;

const MIN_KEEP_ALIVE_PERIOD: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
    expires_at: Option<Instant>,
    mod_revision: i64,
}

#[derive(Clone, Copy, Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug)]
struct Inner {
    available: bool,
    revision: i64,
    next_lease: LeaseId,
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
}

impl Inner {
    /// Drop expired leases, their keys, and keys past their own TTL
    fn purge(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.leases.remove(id);
            debug!("Lease {} expired", id);
        }

        self.entries.retain(|_, entry| {
            let lease_alive = entry.lease.map_or(true, |id| !expired.contains(&id));
            let ttl_alive = entry.expires_at.map_or(true, |at| at > now);
            lease_alive && ttl_alive
        });
    }

    fn insert(&mut self, key: &str, value: &str, lease: Option<LeaseId>, ttl: Option<Duration>) {
        self.revision += 1;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                mod_revision: self.revision,
            },
        );
    }

    fn key_value(key: &str, entry: &Entry) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            lease: entry.lease,
            mod_revision: entry.mod_revision,
        }
    }
}

/// Store kept in process memory.
///
/// Clones share the same data. Time is read from tokio's clock, so paused
/// test runtimes drive lease expiry deterministically.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                revision: 0,
                next_lease: 1,
                entries: BTreeMap::new(),
                leases: HashMap::new(),
            })),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (false) or regaining (true) connectivity. While
    /// unavailable every operation fails and leases are not refreshed.
    pub fn set_available(&self, available: bool) {
        self.guard().available = available;
        debug!("Memory store availability set to {}", available);
    }

    pub fn is_available(&self) -> bool {
        self.guard().available
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the store for an operation, failing while it is unavailable
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.guard();
        if !inner.available {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        inner.purge(Instant::now());
        Ok(inner)
    }

    fn refresh(&self, lease: LeaseId) -> Result<KeepAliveAck> {
        let mut inner = self.lock()?;
        let state = inner
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        state.deadline = Instant::now() + state.ttl;
        Ok(KeepAliveAck {
            id: lease,
            ttl: state.ttl,
        })
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(id) = lease {
            if !inner.leases.contains_key(&id) {
                return Err(StoreError::LeaseNotFound(id));
            }
        }
        inner.insert(key, value, lease, None);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.lock()?;
        Ok(inner.entries.get(key).map(|entry| Inner::key_value(key, entry)))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| Inner::key_value(key, entry))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.lock()?;
        Ok(inner.entries.remove(key).map_or(0, |_| 1))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - inner.entries.len()) as u64)
    }

    async fn grant(&self, ttl: Duration) -> Result<LeaseGrant> {
        let mut inner = self.lock()?;
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        debug!("Granted lease {} with TTL {:?}", id, ttl);
        Ok(LeaseGrant { id, ttl })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let ack = self.refresh(lease)?;
        let period = (ack.ttl / 3).max(MIN_KEEP_ALIVE_PERIOD);
        let ticker = time::interval(period);

        // The first tick fires immediately and produces the initial ack.
        let stream = futures::stream::unfold(
            Some((self.clone(), ticker)),
            move |state| async move {
                let (store, mut ticker) = state?;
                ticker.tick().await;
                match store.refresh(lease) {
                    Ok(ack) => Some((Ok(ack), Some((store, ticker)))),
                    Err(err) => Some((Err(err), None)),
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.leases.remove(&lease).is_none() {
            return Err(StoreError::LeaseNotFound(lease));
        }
        inner.entries.retain(|_, entry| entry.lease != Some(lease));
        debug!("Revoked lease {}", lease);
        Ok(())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<Duration>> {
        let inner = self.lock()?;
        let now = Instant::now();
        Ok(inner
            .leases
            .get(&lease)
            .map(|state| state.deadline.saturating_duration_since(now)))
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        inner.insert(key, value, None, ttl);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.entries.get(key) {
            Some(entry) if entry.value == expected => {
                inner.insert(key, value, None, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl Connector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn KvStore>> {
        if !self.is_available() {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("/a/1", "one", None).await.unwrap();
        store.put("/a/2", "two", None).await.unwrap();
        store.put("/b/1", "three", None).await.unwrap();

        assert_eq!(store.get("/a/1").await.unwrap().unwrap().value, "one");
        assert!(store.get("/a/3").await.unwrap().is_none());

        let keys: Vec<String> = store
            .get_prefix("/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/a/1", "/a/2"]);

        assert_eq!(store.delete("/a/1").await.unwrap(), 1);
        assert_eq!(store.delete("/a/1").await.unwrap(), 0);
        assert_eq!(store.delete_prefix("/").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_mod_revision_increases() {
        let store = MemoryStore::new();
        store.put("/k", "v", None).await.unwrap();
        let first = store.get("/k").await.unwrap().unwrap().mod_revision;
        store.put("/k", "v", None).await.unwrap();
        let second = store.get("/k").await.unwrap().unwrap().mod_revision;
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_removes_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(2)).await.unwrap();
        store.put("/leased", "x", Some(lease.id)).await.unwrap();
        store.put("/plain", "y", None).await.unwrap();

        time::sleep(Duration::from_secs(1)).await;
        assert!(store.get("/leased").await.unwrap().is_some());
        assert!(store.time_to_live(lease.id).await.unwrap().is_some());

        time::sleep(Duration::from_secs(2)).await;
        assert!(store.get("/leased").await.unwrap().is_none());
        assert!(store.get("/plain").await.unwrap().is_some());
        assert!(store.time_to_live(lease.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(3)).await.unwrap();
        store.put("/leased", "x", Some(lease.id)).await.unwrap();

        let mut acks = store.keep_alive(lease.id).await.unwrap();
        for _ in 0..10 {
            let ack = acks.next().await.unwrap().unwrap();
            assert_eq!(ack.id, lease.id);
        }
        // Ten acks at one-second spacing outlive the three-second TTL.
        assert!(store.get("/leased").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_fails_during_outage() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(3)).await.unwrap();
        let mut acks = store.keep_alive(lease.id).await.unwrap();
        acks.next().await.unwrap().unwrap();

        store.set_available(false);
        assert!(matches!(
            acks.next().await.unwrap(),
            Err(StoreError::Unavailable(_))
        ));
        assert!(acks.next().await.is_none());
        assert!(store.connect().await.is_err());

        time::sleep(Duration::from_secs(5)).await;
        store.set_available(true);
        assert!(store.time_to_live(lease.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_removes_bound_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(30)).await.unwrap();
        store.put("/leased", "x", Some(lease.id)).await.unwrap();

        store.revoke(lease.id).await.unwrap();
        assert!(store.get("/leased").await.unwrap().is_none());
        assert!(matches!(
            store.revoke(lease.id).await,
            Err(StoreError::LeaseNotFound(_))
        ));
        assert!(matches!(
            store.put("/again", "x", Some(lease.id)).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_compare_and_swap() {
        let store = MemoryStore::new();
        let ttl = Some(Duration::from_secs(2));

        assert!(store.create("/m", "a", ttl).await.unwrap());
        assert!(!store.create("/m", "b", ttl).await.unwrap());

        assert!(store.compare_and_swap("/m", "a", "a", ttl).await.unwrap());
        assert!(!store.compare_and_swap("/m", "b", "b", ttl).await.unwrap());
        assert!(!store.compare_and_swap("/missing", "a", "a", ttl).await.unwrap());

        time::sleep(Duration::from_secs(3)).await;
        assert!(store.get("/m").await.unwrap().is_none());
        assert!(store.create("/m", "b", ttl).await.unwrap());
    }
}
