//! Registration and heartbeat engine for the edge proxy
//!
//! Keeps the proxy's routing records in the key-value store in step with
//! the liveness of the process serving them:
//! - [`Registry`]: lease-bound server record plus static frontends, with a
//!   background task that re-registers after connectivity loss
//! - [`MasterElector`]: at most one active writer per group, using
//!   create-if-absent and compare-and-swap instead of leases
//! - [`RegistrationStrategy`] and [`Heartbeater`]: the election policies
//!   behind one interface, driven on an interval

pub mod config;
pub mod election;
pub mod error;
pub mod lease;
pub mod publish;
pub mod registry;
pub mod strategy;

pub use config::{fetch_remote_config, RegistryConfig, RemoteConfig};
pub use election::MasterElector;
pub use error::{RegistrarError, Result};
pub use lease::{ConnectionStatus, Lease, LeaseManager};
pub use registry::{RegistrationState, Registry, Scope};
pub use strategy::{
    AppRegistration, GroupMasterStrategy, HandlerRegistration, Heartbeater, MultiMasterStrategy,
    RegistrationStrategy, SingleMasterStrategy, SkipStrategy,
};
