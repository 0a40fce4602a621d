//! Record writers shared by the registry and the electors

use crate::lease::with_deadline;
use crate::Result;
use registrar_api::{BackendSpec, FrontendSpec};
use registrar_store::{KvStore, LeaseId};
use std::time::Duration;
use tracing::debug;

/// Writes records for one namespace, each put bounded by `op_timeout`
pub struct Publisher<'a> {
    store: &'a dyn KvStore,
    namespace: &'a str,
    op_timeout: Duration,
}

impl<'a> Publisher<'a> {
    pub fn new(store: &'a dyn KvStore, namespace: &'a str, op_timeout: Duration) -> Self {
        Self {
            store,
            namespace,
            op_timeout,
        }
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        with_deadline(self.op_timeout, key, self.store.put(key, value, lease)).await?;
        debug!("Wrote {} = {}", key, value);
        Ok(())
    }

    /// Backend type record. Never bound to a lease.
    pub async fn backend_type(&self, backend: &BackendSpec) -> Result<()> {
        let record = backend.type_record()?;
        self.put(&backend.backend_key(self.namespace), &record, None).await
    }

    /// Backend server record bound to `lease`
    pub async fn backend_server(&self, backend: &BackendSpec, lease: LeaseId) -> Result<()> {
        let record = backend.server_record()?;
        self.put(&backend.server_key(self.namespace), &record, Some(lease)).await
    }

    /// Type record first, then the leased server record
    pub async fn backend(&self, backend: &BackendSpec, lease: LeaseId) -> Result<()> {
        self.backend_type(backend).await?;
        self.backend_server(backend, lease).await
    }

    /// Frontend record followed by its middlewares in chain order. Every
    /// record is rendered before the first write, so a payload that fails
    /// to serialize leaves the store untouched.
    pub async fn frontend(&self, frontend: &FrontendSpec) -> Result<()> {
        let record = frontend.record()?;
        let middlewares = frontend.middleware_records()?;

        self.put(&frontend.key(self.namespace), &record, None).await?;
        for (middleware, record) in middlewares {
            self.put(&frontend.middleware_key(self.namespace, middleware), &record, None)
                .await?;
        }
        Ok(())
    }
}
