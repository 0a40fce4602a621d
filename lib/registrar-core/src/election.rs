//! Master election on the server key
//!
//! Instances of one group share a server key. Whoever creates it first is
//! master and keeps the role by compare-and-swapping its own value back in
//! (which also renews the TTL) before it expires. A rejected swap means
//! another instance took over, and the elector drops to slave. Losing the
//! role is normal operation, not an error.

use crate::lease::with_deadline;
use crate::publish::Publisher;
use crate::Result;
use registrar_api::{BackendSpec, FrontendSpec};
use registrar_store::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct MasterElector {
    store: Arc<dyn KvStore>,
    namespace: String,
    ttl: Duration,
    op_timeout: Duration,
    is_master: bool,
}

impl MasterElector {
    pub fn new(store: Arc<dyn KvStore>, namespace: &str, ttl: Duration) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            ttl,
            op_timeout: ttl / 3,
            is_master: false,
        }
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    fn publisher(&self) -> Publisher<'_> {
        Publisher::new(self.store.as_ref(), &self.namespace, self.op_timeout)
    }

    /// Write the backend type record and claim or keep the server key.
    /// Returns whether this instance is master afterwards.
    ///
    /// A master that cannot reach the store steps down: its key may expire
    /// before the next round and be claimed by another instance.
    pub async fn register_app(&mut self, backend: &BackendSpec) -> Result<bool> {
        match self.claim(backend).await {
            Ok(is_master) => Ok(is_master),
            Err(e) => {
                if self.is_master {
                    warn!("Falling back to slave role for {}: {}", backend.app_name, e);
                    self.is_master = false;
                }
                Err(e)
            }
        }
    }

    async fn claim(&mut self, backend: &BackendSpec) -> Result<bool> {
        self.publisher().backend_type(backend).await?;

        let key = backend.server_key(&self.namespace);
        let value = backend.server_record()?;

        if self.is_master {
            let kept = with_deadline(
                self.op_timeout,
                "master compare-and-swap",
                self.store.compare_and_swap(&key, &value, &value, Some(self.ttl)),
            )
            .await?;
            if !kept {
                info!("Falling back to slave role for {}", key);
                self.is_master = false;
            }
        } else {
            let created = with_deadline(
                self.op_timeout,
                "master create",
                self.store.create(&key, &value, Some(self.ttl)),
            )
            .await?;
            if created {
                info!("Assumed master role for {} at {}", key, backend.url);
                self.is_master = true;
            } else {
                debug!("{} is held by another instance", key);
            }
        }

        Ok(self.is_master)
    }

    /// Write a frontend and its middlewares
    pub async fn register_frontend(&self, frontend: &FrontendSpec) -> Result<()> {
        self.publisher().frontend(frontend).await
    }
}
