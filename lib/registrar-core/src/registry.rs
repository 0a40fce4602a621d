//! Registry: publishes one backend and its frontends, and keeps them
//! published while the process runs
//!
//! `start` performs one registration pass in the caller's task and fails
//! fast. Afterwards a background task keeps the lease alive, and whenever a
//! full TTL passes without a keep-alive ack it opens a new session, takes
//! a new lease and writes every record again. `stop` revokes the lease,
//! removes the server record and waits for the task to exit.

use crate::config::RegistryConfig;
use crate::lease::{with_deadline, ConnectionStatus, Lease, LeaseManager};
use crate::publish::Publisher;
use crate::{RegistrarError, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use registrar_api::{BackendSpec, FrontendSpec, Middleware};
use registrar_store::{Connector, EtcdConnector, KeepAliveAck, KeepAliveStream, LeaseId, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Observable snapshot of the registration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrationState {
    pub status: ConnectionStatus,
    /// Lease the server record is bound to
    pub lease_id: Option<LeaseId>,
    /// Wall-clock time of the last keep-alive ack
    pub last_ack: Option<DateTime<Utc>>,
}

/// API audience a frontend is exposed to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Public,
    Protected,
}

enum Worker {
    Idle,
    Running {
        stop_tx: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

pub struct Registry {
    config: RegistryConfig,
    connector: Arc<dyn Connector>,
    backend: BackendSpec,
    frontends: Vec<FrontendSpec>,
    state_tx: Arc<watch::Sender<RegistrationState>>,
    worker: Mutex<Worker>,
}

impl Registry {
    pub fn new(mut config: RegistryConfig, connector: Arc<dyn Connector>, backend: BackendSpec) -> Self {
        config.apply_static_defaults();
        let (state_tx, _) = watch::channel(RegistrationState::default());

        Self {
            config,
            connector,
            backend,
            frontends: Vec::new(),
            state_tx: Arc::new(state_tx),
            worker: Mutex::new(Worker::Idle),
        }
    }

    /// Registry for `app` listening on `listen_ip:listen_port`, backed by
    /// the etcd cluster in `config.etcd`
    pub fn with_etcd(config: RegistryConfig, app: &str, listen_ip: &str, listen_port: u16) -> Result<Self> {
        let etcd = config
            .etcd
            .clone()
            .ok_or_else(|| RegistrarError::Configuration("etcd configuration is required".to_string()))?;
        let connector = EtcdConnector::new(etcd)?;
        let backend = BackendSpec::new(app, listen_ip, listen_port)?;
        Ok(Self::new(config, Arc::new(connector), backend))
    }

    pub fn backend(&self) -> &BackendSpec {
        &self.backend
    }

    pub fn frontends(&self) -> &[FrontendSpec] {
        &self.frontends
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn ensure_idle(&mut self) -> Result<()> {
        match self.worker.get_mut() {
            Worker::Idle => Ok(()),
            _ => Err(RegistrarError::InvalidState("frontends must be added before start")),
        }
    }

    /// Add a route to the backend. Must be called before `start`.
    pub fn add_frontend<S: AsRef<str>>(
        &mut self,
        host: &str,
        path: &str,
        methods: &[S],
        middlewares: Vec<Middleware>,
    ) -> Result<()> {
        self.ensure_idle()?;
        let fes = FrontendSpec::new(&self.backend.app_name, host, path, methods, middlewares);
        debug!("Added frontend {} on {}", fes.id, fes.host);
        self.frontends.push(fes);
        Ok(())
    }

    /// Add a route under the API host of every given scope. Scopes without
    /// a configured host are skipped. Returns how many frontends were added
    /// and fails only when none was.
    pub fn add_scoped_frontend<S: AsRef<str>>(
        &mut self,
        scopes: &[Scope],
        path: &str,
        methods: &[S],
        middlewares: Vec<Middleware>,
    ) -> Result<usize> {
        self.ensure_idle()?;

        let mut added = 0;
        for scope in scopes {
            let host = match scope {
                Scope::Public => self.config.public_api_host.clone(),
                Scope::Protected => self.config.protected_api_host.clone(),
            };
            match host.filter(|h| !h.is_empty()) {
                Some(host) => {
                    self.add_frontend(&host, path, methods, middlewares.clone())?;
                    added += 1;
                }
                None => warn!("No API host configured for {:?} scope, skipping {}", scope, path),
            }
        }

        if added == 0 {
            return Err(RegistrarError::Configuration(format!(
                "no API host configured for scopes {:?}",
                scopes
            )));
        }
        Ok(added)
    }

    /// Register synchronously, then keep the registration alive in the
    /// background
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if !matches!(*worker, Worker::Idle) {
            return Err(RegistrarError::InvalidState("registry already started"));
        }

        let mut engine = Engine {
            namespace: self.config.namespace.clone(),
            ttl: self.config.ttl,
            retry_interval: self.config.retry_interval,
            op_timeout: self.config.ttl / 3,
            connector: self.connector.clone(),
            backend: self.backend.clone(),
            frontends: self.frontends.clone(),
            state_tx: self.state_tx.clone(),
            session: None,
            acks: None,
        };
        engine.connect_and_register().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(stop_rx));
        *worker = Worker::Running { stop_tx, handle };

        info!(
            "Registered {} as {} with {} frontends",
            self.backend.app_name,
            self.backend.instance_id,
            self.frontends.len()
        );
        Ok(())
    }

    /// Stop the background task, revoke the lease and delete the server
    /// record. Only the first call does anything; it returns once the task
    /// has exited.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        let Worker::Running { stop_tx, mut handle } = std::mem::replace(&mut *worker, Worker::Stopped) else {
            return;
        };

        let _ = stop_tx.send(true);
        let limit = self.config.ttl;
        match time::timeout(limit, &mut handle).await {
            Ok(Ok(())) => info!("Registration of {} stopped", self.backend.app_name),
            Ok(Err(e)) => error!("Registration task failed: {}", e),
            Err(_) => {
                warn!("Registration task did not stop within {:?}, aborting", limit);
                handle.abort();
                let _ = handle.await;
                self.state_tx.send_modify(|state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.lease_id = None;
                });
            }
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state_tx.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }
}

struct Session {
    leases: LeaseManager,
    lease: Lease,
}

enum Event {
    Stop,
    Tick,
    Ack(Option<std::result::Result<KeepAliveAck, StoreError>>),
}

/// State owned by the background task
struct Engine {
    namespace: String,
    ttl: Duration,
    retry_interval: Duration,
    op_timeout: Duration,
    connector: Arc<dyn Connector>,
    backend: BackendSpec,
    frontends: Vec<FrontendSpec>,
    state_tx: Arc<watch::Sender<RegistrationState>>,
    session: Option<Session>,
    acks: Option<KeepAliveStream>,
}

/// Next ack, or pending forever when no stream is open
async fn next_ack(acks: &mut Option<KeepAliveStream>) -> Option<std::result::Result<KeepAliveAck, StoreError>> {
    match acks {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

impl Engine {
    fn set_status(&self, status: ConnectionStatus, lease_id: Option<LeaseId>) {
        self.state_tx.send_modify(|state| {
            state.status = status;
            state.lease_id = lease_id;
        });
    }

    fn lease_id(&self) -> Option<LeaseId> {
        self.session.as_ref().map(|s| s.lease.id)
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = time::interval_at(Instant::now() + self.ttl, self.ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut acked = true;

        loop {
            let event = tokio::select! {
                _ = stop_rx.changed() => Event::Stop,
                _ = ticker.tick() => Event::Tick,
                ack = next_ack(&mut self.acks) => Event::Ack(ack),
            };

            match event {
                Event::Stop => break,
                Event::Ack(Some(Ok(ack))) => {
                    acked = true;
                    self.state_tx.send_modify(|state| {
                        state.status = ConnectionStatus::Alive;
                        state.lease_id = Some(ack.id);
                        state.last_ack = Some(Utc::now());
                    });
                }
                Event::Ack(Some(Err(e))) => {
                    warn!("Keep-alive for lease {:?} failed: {}", self.lease_id(), e);
                    acked = false;
                    self.acks = None;
                    self.set_status(ConnectionStatus::Disconnected, self.lease_id());
                }
                Event::Ack(None) => {
                    warn!("Keep-alive stream for lease {:?} closed", self.lease_id());
                    acked = false;
                    self.acks = None;
                    self.set_status(ConnectionStatus::Disconnected, self.lease_id());
                }
                Event::Tick if acked => acked = false,
                Event::Tick => {
                    warn!("No keep-alive ack within {:?}, re-registering", self.ttl);
                    if !self.reconnect(&mut stop_rx).await {
                        break;
                    }
                    acked = true;
                    ticker.reset();
                }
            }
        }

        self.shutdown().await;
    }

    /// Retry full registration passes until one succeeds. Returns false
    /// when stopped first.
    async fn reconnect(&mut self, stop_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            let result = tokio::select! {
                _ = stop_rx.changed() => return false,
                result = self.connect_and_register() => result,
            };

            match result {
                Ok(()) => {
                    info!(
                        "Re-registered {} with lease {:?}",
                        self.backend.app_name,
                        self.lease_id()
                    );
                    return true;
                }
                Err(e) => warn!(
                    "Registration pass failed, retrying in {:?}: {}",
                    self.retry_interval, e
                ),
            }

            tokio::select! {
                _ = stop_rx.changed() => return false,
                _ = time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// One full registration pass on a new session. A failed pass releases
    /// the lease it acquired.
    async fn connect_and_register(&mut self) -> Result<()> {
        self.acks = None;
        if let Some(old) = self.session.take() {
            debug!("Abandoning session with lease {}", old.lease.id);
        }
        self.set_status(ConnectionStatus::Connecting, None);

        let result = self.register_pass().await;
        if result.is_err() {
            self.acks = None;
            if let Some(session) = self.session.take() {
                session.leases.revoke_bounded(&session.lease).await;
            }
            self.set_status(ConnectionStatus::Disconnected, None);
        }
        result
    }

    async fn register_pass(&mut self) -> Result<()> {
        let store = with_deadline(self.op_timeout, "store connect", self.connector.connect()).await?;
        let leases = LeaseManager::new(store.clone(), self.ttl);
        let lease = leases.acquire().await?;
        let acks = leases.keep_alive(&lease).await;
        self.session = Some(Session { leases, lease });
        self.acks = Some(acks?);
        self.set_status(ConnectionStatus::Connected, Some(lease.id));

        let publisher = Publisher::new(store.as_ref(), &self.namespace, self.op_timeout);
        publisher.backend(&self.backend, lease.id).await?;
        for fes in &self.frontends {
            publisher.frontend(fes).await?;
        }
        Ok(())
    }

    async fn shutdown(mut self) {
        self.acks = None;
        if let Some(session) = self.session.take() {
            session.leases.revoke(&session.lease).await;

            let key = self.backend.server_key(&self.namespace);
            let store = session.leases.store();
            if let Err(e) = with_deadline(self.op_timeout, "server record delete", store.delete(&key)).await {
                warn!("Failed to delete {}: {}", key, e);
            }
        }
        self.set_status(ConnectionStatus::Disconnected, None);
    }
}
