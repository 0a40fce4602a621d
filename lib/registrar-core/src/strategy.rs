//! Registration strategies built on the master elector, and a heartbeater
//! that drives them on an interval

use crate::election::MasterElector;
use crate::{RegistrarError, Result};
use registrar_api::{BackendSpec, FrontendSpec, Middleware};
use registrar_store::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Group id shared by every instance under [`SingleMasterStrategy`]
pub const MASTER_GROUP: &str = "master";

/// An application process to register
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppRegistration {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// A route served by an application
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerRegistration {
    pub name: String,
    pub host: String,
    pub path: String,
    pub methods: Vec<String>,
    pub middlewares: Vec<Middleware>,
}

impl HandlerRegistration {
    fn frontend(&self) -> FrontendSpec {
        FrontendSpec::new(
            &self.name,
            &self.host,
            &self.path,
            self.methods.as_slice(),
            self.middlewares.clone(),
        )
    }
}

/// How an application announces itself and its routes
#[async_trait::async_trait]
pub trait RegistrationStrategy: Send {
    async fn register_app(&mut self, app: &AppRegistration) -> Result<()>;

    async fn register_handler(&mut self, handler: &HandlerRegistration) -> Result<()>;
}

/// One master per group: every instance competes for the server key named
/// after the group
pub struct GroupMasterStrategy {
    group: String,
    elector: MasterElector,
}

impl GroupMasterStrategy {
    pub fn new(store: Arc<dyn KvStore>, namespace: &str, group: &str, ttl: Duration) -> Self {
        Self {
            group: group.to_string(),
            elector: MasterElector::new(store, namespace, ttl),
        }
    }

    pub fn is_master(&self) -> bool {
        self.elector.is_master()
    }
}

#[async_trait::async_trait]
impl RegistrationStrategy for GroupMasterStrategy {
    async fn register_app(&mut self, app: &AppRegistration) -> Result<()> {
        debug!("Registering app {} in group {}", app.name, self.group);
        let backend = BackendSpec::with_id(&self.group, &app.name, &app.host, app.port)?;
        self.elector.register_app(&backend).await?;
        Ok(())
    }

    async fn register_handler(&mut self, handler: &HandlerRegistration) -> Result<()> {
        self.elector.register_frontend(&handler.frontend()).await
    }
}

/// One master across all instances of the app
pub struct SingleMasterStrategy {
    inner: GroupMasterStrategy,
}

impl SingleMasterStrategy {
    pub fn new(store: Arc<dyn KvStore>, namespace: &str, ttl: Duration) -> Self {
        Self {
            inner: GroupMasterStrategy::new(store, namespace, MASTER_GROUP, ttl),
        }
    }

    pub fn is_master(&self) -> bool {
        self.inner.is_master()
    }
}

#[async_trait::async_trait]
impl RegistrationStrategy for SingleMasterStrategy {
    async fn register_app(&mut self, app: &AppRegistration) -> Result<()> {
        self.inner.register_app(app).await
    }

    async fn register_handler(&mut self, handler: &HandlerRegistration) -> Result<()> {
        self.inner.register_handler(handler).await
    }
}

/// Every instance serves traffic: each one owns a server key named
/// `{hostname}_{port}`
pub struct MultiMasterStrategy {
    elector: MasterElector,
}

impl MultiMasterStrategy {
    pub fn new(store: Arc<dyn KvStore>, namespace: &str, ttl: Duration) -> Self {
        Self {
            elector: MasterElector::new(store, namespace, ttl),
        }
    }
}

#[async_trait::async_trait]
impl RegistrationStrategy for MultiMasterStrategy {
    async fn register_app(&mut self, app: &AppRegistration) -> Result<()> {
        let backend = BackendSpec::new(&app.name, &app.host, app.port)?;
        self.elector.register_app(&backend).await?;
        Ok(())
    }

    async fn register_handler(&mut self, handler: &HandlerRegistration) -> Result<()> {
        self.elector.register_frontend(&handler.frontend()).await
    }
}

/// For applications that do not take part in discovery
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipStrategy;

#[async_trait::async_trait]
impl RegistrationStrategy for SkipStrategy {
    async fn register_app(&mut self, app: &AppRegistration) -> Result<()> {
        info!("Skipping registration of app {}", app.name);
        Ok(())
    }

    async fn register_handler(&mut self, handler: &HandlerRegistration) -> Result<()> {
        info!("Skipping registration of handler {} {}", handler.host, handler.path);
        Ok(())
    }
}

/// Calls `register_app` on a fixed interval in a background task
pub struct Heartbeater {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Box<dyn RegistrationStrategy>>,
}

impl Heartbeater {
    /// Start beating. The first registration happens immediately.
    pub fn start(
        app: AppRegistration,
        mut strategy: Box<dyn RegistrationStrategy>,
        interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = strategy.register_app(&app).await {
                            warn!("Heartbeat for {} failed: {}", app.name, e);
                        }
                    }
                }
            }
            debug!("Heartbeat for {} stopped", app.name);
            strategy
        });

        Self { stop_tx, handle }
    }

    /// Stop beating and hand the strategy back
    pub async fn stop(self) -> Result<Box<dyn RegistrationStrategy>> {
        let _ = self.stop_tx.send(true);
        self.handle
            .await
            .map_err(|e| RegistrarError::Task(e.to_string()))
    }
}
