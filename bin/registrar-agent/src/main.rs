use anyhow::{Context, Result};
use registrar_core::{
    fetch_remote_config, AppRegistration, GroupMasterStrategy, HandlerRegistration, Heartbeater,
    MultiMasterStrategy, RegistrationStrategy, Registry, Scope, SingleMasterStrategy, SkipStrategy,
};
use registrar_store::{Connector, EtcdConnector, KvStore};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{AgentConfig, Mode};

const DEFAULT_CONFIG_PATH: &str = "registrar.yaml";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match std::env::var("REGISTRAR_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = std::env::var("REGISTRAR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    info!("Starting registrar-agent with config {}", path);

    let mut agent = AgentConfig::load(&path)?;
    agent.registry.apply_defaults()?;

    if agent.fetch_remote_config {
        let store = connect(&agent).await?;
        let remote = fetch_remote_config(store.as_ref(), &agent.remote_config_prefix, &agent.app_name).await?;
        info!(
            "Using remote config: namespace {}, public API {}, protected API {}",
            remote.vulcand_namespace, remote.public_api_url, remote.protected_api_url
        );
        agent.registry.merge_remote(&remote);
    }

    match agent.mode {
        Mode::Lease => run_registry(agent).await,
        _ => run_strategy(agent).await,
    }
}

async fn connect(agent: &AgentConfig) -> Result<Arc<dyn KvStore>> {
    let etcd = agent
        .registry
        .etcd
        .clone()
        .context("etcd configuration is required")?;
    let connector = EtcdConnector::new(etcd)?;
    Ok(connector.connect().await?)
}

/// What a signal asks the agent to do
enum Shutdown {
    Deregister,
    Exit,
}

async fn next_signal() -> Result<Shutdown> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = usr1.recv() => Ok(Shutdown::Deregister),
        _ = term.recv() => Ok(Shutdown::Exit),
        res = tokio::signal::ctrl_c() => res.map(|_| Shutdown::Exit).map_err(Into::into),
    }
}

async fn run_registry(agent: AgentConfig) -> Result<()> {
    let mut registry = Registry::with_etcd(
        agent.registry.clone(),
        &agent.app_name,
        &agent.listen_ip,
        agent.listen_port,
    )?;

    for fes in &agent.frontends {
        let middlewares = fes.middlewares()?;
        match &fes.host {
            Some(host) => registry.add_frontend(host, &fes.path, fes.methods.as_slice(), middlewares)?,
            None => {
                registry.add_scoped_frontend(&fes.scopes(), &fes.path, fes.methods.as_slice(), middlewares)?;
            }
        }
    }

    registry
        .start()
        .await
        .with_context(|| format!("failed to register {}", agent.app_name))?;

    loop {
        match next_signal().await? {
            Shutdown::Deregister => {
                info!("SIGUSR1 received, deregistering {}", agent.app_name);
                registry.stop().await;
            }
            Shutdown::Exit => break,
        }
    }

    info!("Shutdown signal received, exiting...");
    registry.stop().await;
    Ok(())
}

async fn run_strategy(agent: AgentConfig) -> Result<()> {
    let store = connect(&agent).await?;
    let namespace = agent.registry.namespace.as_str();
    let ttl = agent.registry.ttl;

    let mut strategy: Box<dyn RegistrationStrategy> = match &agent.mode {
        Mode::SingleMaster => Box::new(SingleMasterStrategy::new(store, namespace, ttl)),
        Mode::GroupMaster { group } => Box::new(GroupMasterStrategy::new(store, namespace, group, ttl)),
        Mode::MultiMaster => Box::new(MultiMasterStrategy::new(store, namespace, ttl)),
        Mode::Skip | Mode::Lease => Box::new(SkipStrategy),
    };

    for fes in &agent.frontends {
        let hosts: Vec<String> = match &fes.host {
            Some(host) => vec![host.clone()],
            None => fes
                .scopes()
                .into_iter()
                .filter_map(|scope| match scope {
                    Scope::Public => agent.registry.public_api_host.clone(),
                    Scope::Protected => agent.registry.protected_api_host.clone(),
                })
                .collect(),
        };
        if hosts.is_empty() {
            warn!("No host configured for {}, skipping", fes.path);
        }

        for host in hosts {
            let handler = HandlerRegistration {
                name: agent.app_name.clone(),
                host,
                path: fes.path.clone(),
                methods: fes.methods.clone(),
                middlewares: fes.middlewares()?,
            };
            strategy.register_handler(&handler).await?;
        }
    }

    let app = AppRegistration {
        name: agent.app_name.clone(),
        host: agent.listen_ip.clone(),
        port: agent.listen_port,
    };
    let mut heartbeater = Some(Heartbeater::start(app, strategy, ttl / 3));

    loop {
        let shutdown = next_signal().await?;
        if let Some(running) = heartbeater.take() {
            running.stop().await?;
            info!("Heartbeat for {} stopped", agent.app_name);
        }
        if let Shutdown::Exit = shutdown {
            break;
        }
    }

    info!("Shutdown signal received, exiting...");
    Ok(())
}
