//! The store seam shared by every client

use crate::Result;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

/// Store-assigned lease identifier
pub type LeaseId = i64;

/// A key with its current value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Lease the key is bound to, if any
    pub lease: Option<LeaseId>,
    /// Store revision of the last write to this key
    pub mod_revision: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Acknowledgement of a single keep-alive refresh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Stream of keep-alive acknowledgements. It ends after the first error;
/// dropping it stops refreshing the lease.
pub type KeepAliveStream = BoxStream<'static, Result<KeepAliveAck>>;

/// Operations the registrar performs against the store
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Write a key, optionally bound to a lease
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// All keys starting with `prefix`, in key order
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Delete a key, returning the number of keys removed
    async fn delete(&self, key: &str) -> Result<u64>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    async fn grant(&self, ttl: Duration) -> Result<LeaseGrant>;

    /// Start refreshing a lease at a third of its TTL
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke a lease, deleting every key bound to it
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Remaining TTL of a lease, `None` once it has expired
    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<Duration>>;

    /// Write a key only if it does not exist yet. With a TTL the key expires
    /// unless it is rewritten in time.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Replace the value of a key only if it currently equals `expected`.
    /// Returns false when the key is missing or holds something else.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;
}

/// Opens store sessions. Each registration pass starts from a new one.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn KvStore>>;
}
