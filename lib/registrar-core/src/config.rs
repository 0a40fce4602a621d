//! Registry configuration
//!
//! Values come from three places, in order of precedence: whatever the
//! caller set explicitly (YAML or code), the `ETCD3_*` environment
//! variables, and the built-in defaults below.

use crate::{RegistrarError, Result};
use registrar_store::{EtcdConfig, KvStore, TlsConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_NAMESPACE: &str = "/vulcand";
pub const DEFAULT_REMOTE_CONFIG_PREFIX: &str = "/mailgun/configs";
pub const LOCAL_INSECURE_ENDPOINT: &str = "http://127.0.0.1:2379";
pub const LOCAL_SECURE_ENDPOINT: &str = "https://127.0.0.1:2379";

pub const ENV_ENDPOINT: &str = "ETCD3_ENDPOINT";
pub const ENV_USER: &str = "ETCD3_USER";
pub const ENV_PASSWORD: &str = "ETCD3_PASSWORD";
pub const ENV_NAMESPACE: &str = "ETCD3_VULCAND_NAMESPACE";
pub const ENV_TLS_CERT: &str = "ETCD3_TLS_CERT";
pub const ENV_TLS_KEY: &str = "ETCD3_TLS_KEY";
pub const ENV_CA: &str = "ETCD3_CA";

/// Settings shared by the registry, the electors and the agent.
///
/// Empty strings and zero durations mean "not set" and are filled in by
/// [`RegistryConfig::apply_defaults`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Key prefix every record is written under
    pub namespace: String,
    /// Lease TTL, in whole seconds when written as YAML
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Pause between failed registration passes
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    pub etcd: Option<EtcdConfig>,
    /// Host serving the public API scope
    pub public_api_host: Option<String>,
    /// Host serving the protected API scope
    pub protected_api_host: Option<String>,
}

impl RegistryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RegistrarError::Configuration(format!("failed to parse config: {}", e)))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RegistrarError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Fill unset timing and namespace values with the built-in defaults.
    /// Never touches the environment.
    pub fn apply_static_defaults(&mut self) {
        if self.ttl.is_zero() {
            self.ttl = DEFAULT_TTL;
        }
        if self.retry_interval.is_zero() {
            self.retry_interval = DEFAULT_RETRY_INTERVAL;
        }
        if self.namespace.is_empty() {
            self.namespace = DEFAULT_NAMESPACE.to_string();
        }
    }

    /// Fill unset values from the process environment and the defaults
    pub fn apply_defaults(&mut self) -> Result<()> {
        self.apply_defaults_from(|name| std::env::var(name).ok())
    }

    /// Same as [`apply_defaults`](Self::apply_defaults) with an injected
    /// environment lookup.
    pub fn apply_defaults_from<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| env(name).filter(|value| !value.is_empty());

        if self.namespace.is_empty() {
            if let Some(namespace) = env(ENV_NAMESPACE) {
                self.namespace = namespace;
            }
        }
        self.apply_static_defaults();

        let etcd = self.etcd.get_or_insert_with(EtcdConfig::default);
        if etcd.endpoints.is_empty() {
            let endpoint = env(ENV_ENDPOINT).unwrap_or_else(|| LOCAL_INSECURE_ENDPOINT.to_string());
            etcd.endpoints.push(endpoint);
        }
        if etcd.username.is_none() {
            etcd.username = env(ENV_USER);
        }
        if etcd.password.is_none() {
            etcd.password = env(ENV_PASSWORD);
        }

        let (cert, key, ca) = (env(ENV_TLS_CERT), env(ENV_TLS_KEY), env(ENV_CA));
        if cert.is_some() || key.is_some() || ca.is_some() {
            let tls = etcd.tls.get_or_insert_with(TlsConfig::default);
            if tls.cert_file.is_none() {
                tls.cert_file = cert;
            }
            if tls.key_file.is_none() {
                tls.key_file = key;
            }
            if tls.ca_file.is_none() {
                tls.ca_file = ca;
            }
        }

        match etcd.username.as_deref() {
            None | Some("") => return Ok(()),
            Some(_) => {}
        }

        if etcd.password.as_deref().map_or(true, str::is_empty) {
            return Err(RegistrarError::Configuration(
                "etcd username provided but password is empty".to_string(),
            ));
        }

        // Credentials travel over TLS. Without any TLS settings the server
        // certificate is not verified.
        etcd.tls.get_or_insert_with(|| TlsConfig {
            insecure_skip_verify: true,
            ..Default::default()
        });

        if etcd.endpoints[0] == LOCAL_INSECURE_ENDPOINT {
            etcd.endpoints[0] = LOCAL_SECURE_ENDPOINT.to_string();
        }

        if !etcd.endpoints[0].starts_with("https://") {
            return Err(RegistrarError::Configuration(
                "when connecting to etcd via TLS with credentials endpoint must begin with https://"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Overwrite fields with the non-empty values of a remote config
    pub fn merge_remote(&mut self, remote: &RemoteConfig) {
        if !remote.vulcand_namespace.is_empty() {
            self.namespace = remote.vulcand_namespace.clone();
        }
        if !remote.public_api_host.is_empty() {
            self.public_api_host = Some(remote.public_api_host.clone());
        }
        if !remote.protected_api_host.is_empty() {
            self.protected_api_host = Some(remote.protected_api_host.clone());
        }
    }
}

/// Per-application settings kept in the store as a JSON document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub vulcand_namespace: String,
    pub public_api_host: String,
    pub public_api_url: String,
    pub protected_api_host: String,
    pub protected_api_url: String,
}

/// Read `{prefix}/{app}` from the store and parse it as a [`RemoteConfig`]
pub async fn fetch_remote_config(store: &dyn KvStore, prefix: &str, app: &str) -> Result<RemoteConfig> {
    let key = format!("{}/{}", prefix.trim_end_matches('/'), app);
    let kv = store
        .get(&key)
        .await?
        .ok_or_else(|| RegistrarError::Configuration(format!("config not found while retrieving '{}'", key)))?;

    let config: RemoteConfig = serde_json::from_str(&kv.value).map_err(|e| {
        RegistrarError::Configuration(format!("while parsing json from store config '{}': {}", key, e))
    })?;
    debug!("Fetched remote config from {}", key);
    Ok(config)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
