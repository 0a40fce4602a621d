//! Agent configuration file

use anyhow::{Context, Result};
use registrar_api::middleware::{
    CIRCUIT_BREAKER_TYPE, CONN_LIMIT_TYPE, RATE_LIMIT_TYPE, REWRITE_TYPE,
};
use registrar_api::Middleware;
use registrar_core::config::DEFAULT_REMOTE_CONFIG_PREFIX;
use registrar_core::{RegistryConfig, Scope};
use serde::Deserialize;
use std::path::Path;

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_remote_prefix() -> String {
    DEFAULT_REMOTE_CONFIG_PREFIX.to_string()
}

/// How the agent keeps the backend registered
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Mode {
    /// Lease-bound server record with keep-alive
    #[default]
    Lease,
    SingleMaster,
    GroupMaster { group: String },
    MultiMaster,
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeName {
    Public,
    Protected,
}

impl From<ScopeName> for Scope {
    fn from(name: ScopeName) -> Self {
        match name {
            ScopeName::Public => Scope::Public,
            ScopeName::Protected => Scope::Protected,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Option<String>,
    /// Payload in the proxy's own field names
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl MiddlewareConfig {
    pub fn build(&self) -> Result<Middleware> {
        let spec = self.spec.clone();
        let middleware = match self.kind.as_str() {
            RATE_LIMIT_TYPE => Middleware::rate_limit(serde_json::from_value(spec)?),
            REWRITE_TYPE => Middleware::rewrite(serde_json::from_value(spec)?),
            CONN_LIMIT_TYPE => Middleware::conn_limit(serde_json::from_value(spec)?),
            CIRCUIT_BREAKER_TYPE => Middleware::circuit_breaker(serde_json::from_value(spec)?),
            other => Middleware::custom(other, other, spec),
        };

        Ok(match &self.id {
            Some(id) => middleware.with_id(id.as_str()),
            None => middleware,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FrontendConfig {
    /// Explicit host. When absent, `scopes` pick the configured API hosts.
    pub host: Option<String>,
    #[serde(default)]
    pub scopes: Vec<ScopeName>,
    pub path: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,
}

impl FrontendConfig {
    pub fn middlewares(&self) -> Result<Vec<Middleware>> {
        self.middlewares
            .iter()
            .map(|mw| {
                mw.build()
                    .with_context(|| format!("invalid {} middleware on {}", mw.kind, self.path))
            })
            .collect()
    }

    pub fn scopes(&self) -> Vec<Scope> {
        self.scopes.iter().map(|s| Scope::from(*s)).collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfig {
    pub app_name: String,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    pub listen_port: u16,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Merge per-app settings stored under `remote_config_prefix`
    #[serde(default)]
    pub fetch_remote_config: bool,
    #[serde(default = "default_remote_prefix")]
    pub remote_config_prefix: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
