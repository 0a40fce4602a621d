//! Key-value store clients for route registration
//!
//! The registrar only needs a small slice of an etcd-like store: plain
//! puts and deletes, TTL leases with keep-alive, and two atomic writes
//! (create-if-absent and compare-and-swap). [`KvStore`] captures that
//! slice; [`Connector`] opens a fresh session on it.
//!
//! Two implementations ship here:
//! - [`MemoryStore`]: in-process, with a switch that simulates outages
//! - [`EtcdStore`]: etcd v3 through its JSON/HTTP gateway

pub mod error;
pub mod etcd;
pub mod memory;
pub mod store;

pub use error::{Result, StoreError};
pub use etcd::{EtcdConfig, EtcdConnector, EtcdStore, TlsConfig};
pub use memory::MemoryStore;
pub use store::{Connector, KeepAliveAck, KeepAliveStream, KeyValue, KvStore, LeaseGrant, LeaseId};
