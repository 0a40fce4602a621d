//! Lease acquisition, keep-alive and revocation

use crate::{RegistrarError, Result};
use registrar_store::{KeepAliveStream, KvStore, LeaseId};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// Connectivity of a registration session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// Opening a session and acquiring a lease
    Connecting,
    /// Lease granted, records being written or waiting for the first ack
    Connected,
    /// Keep-alive acknowledged within the last tick
    Alive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Run a store operation under a deadline
pub async fn with_deadline<T, E, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<RegistrarError>,
{
    match time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(RegistrarError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}

/// Manages the lease of one store session
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    op_timeout: Duration,
}

impl LeaseManager {
    /// Store operations are bounded by a third of the TTL
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            op_timeout: ttl / 3,
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Grant a fresh lease with the configured TTL
    pub async fn acquire(&self) -> Result<Lease> {
        let grant = with_deadline(self.op_timeout, "lease grant", self.store.grant(self.ttl)).await?;
        debug!("Acquired lease {} (ttl {:?})", grant.id, grant.ttl);
        Ok(Lease {
            id: grant.id,
            ttl: grant.ttl,
        })
    }

    /// Start keeping a lease alive. Acks arrive on the returned stream.
    pub async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream> {
        with_deadline(self.op_timeout, "lease keep-alive", self.store.keep_alive(lease.id)).await
    }

    /// Revoke a lease without a deadline. Failures are only logged since an
    /// unrevoked lease still expires on its own.
    pub async fn revoke(&self, lease: &Lease) {
        match self.store.revoke(lease.id).await {
            Ok(()) => info!("Revoked lease {}", lease.id),
            Err(e) => warn!("Failed to revoke lease {}: {}", lease.id, e),
        }
    }

    /// Revoke a lease, giving up after the operation deadline
    pub async fn revoke_bounded(&self, lease: &Lease) {
        if let Err(e) = with_deadline(self.op_timeout, "lease revoke", self.store.revoke(lease.id)).await {
            warn!("Failed to revoke lease {}: {}", lease.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use registrar_store::{MemoryStore, StoreError};

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_keep_alive() {
        let store = MemoryStore::new();
        let leases = LeaseManager::new(Arc::new(store.clone()), Duration::from_secs(3));
        assert_eq!(leases.op_timeout(), Duration::from_secs(1));

        let lease = leases.acquire().await.unwrap();
        let mut acks = leases.keep_alive(&lease).await.unwrap();
        let ack = acks.next().await.unwrap().unwrap();
        assert_eq!(ack.id, lease.id);

        // The stream refreshes only while it is polled
        for _ in 0..10 {
            acks.next().await.unwrap().unwrap();
        }
        assert!(store.time_to_live(lease.id).await.unwrap().is_some());

        drop(acks);
        time::sleep(Duration::from_secs(4)).await;
        assert!(store.time_to_live(lease.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_fails_when_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let leases = LeaseManager::new(Arc::new(store), Duration::from_secs(3));
        assert!(matches!(
            leases.acquire().await,
            Err(RegistrarError::Connection(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_revoke_is_best_effort() {
        let store = MemoryStore::new();
        let leases = LeaseManager::new(Arc::new(store.clone()), Duration::from_secs(3));
        let lease = leases.acquire().await.unwrap();

        leases.revoke(&lease).await;
        // Second revoke fails inside the store and is only logged
        leases.revoke(&lease).await;
        leases.revoke_bounded(&lease).await;
        assert!(store.time_to_live(lease.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let result: Result<()> = with_deadline(Duration::from_secs(1), "slow op", async {
            time::sleep(Duration::from_secs(5)).await;
            Ok::<(), StoreError>(())
        })
        .await;
        match result {
            Err(RegistrarError::Timeout { operation, after }) => {
                assert_eq!(operation, "slow op");
                assert_eq!(after, Duration::from_secs(1));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
