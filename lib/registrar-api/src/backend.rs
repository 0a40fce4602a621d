//! Backend (application process) specs

use crate::net::{local_hostname, private_ipv4_addrs};
use crate::{keys, Result, SpecError};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// HTTP transport settings the proxy uses towards the backend.
///
/// Mirrors the proxy's own backend settings type so callers can configure
/// it without depending on the proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackendSettings {
    pub timeouts: Timeouts,
    pub keep_alive: KeepAlive,
    #[serde(rename = "TLSSettings", skip_serializing_if = "Option::is_none", default)]
    pub tls_settings: Option<TlsSettings>,
}

/// Timeouts as duration strings, e.g. `"5s"`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Timeouts {
    pub read: String,
    pub dial: String,
    #[serde(rename = "TLSHandshake")]
    pub tls_handshake: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeepAlive {
    pub period: String,
    pub max_idle_conns_per_host: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TlsSettings {
    pub prefer_server_cipher_suites: bool,
    pub insecure_skip_verify: bool,
    pub min_version: String,
    pub max_version: String,
    pub session_tickets_disabled: bool,
    pub session_cache: SessionCache,
    pub cipher_suites: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionCache {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub settings: Option<SessionCacheSettings>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionCacheSettings {
    pub capacity: u32,
}

/// Identity of one application process
#[derive(Clone, Debug, PartialEq)]
pub struct BackendSpec {
    pub app_name: String,
    /// Server id under the app, `{hostname}_{port}` unless given explicitly
    pub instance_id: String,
    /// URL the proxy forwards to
    pub url: String,
    pub settings: Option<BackendSettings>,
}

#[derive(Serialize)]
struct TypeRecord<'a> {
    #[serde(rename = "Type")]
    kind: &'a str,
    #[serde(rename = "Settings", skip_serializing_if = "Option::is_none")]
    settings: Option<&'a BackendSettings>,
}

#[derive(Serialize)]
struct ServerRecord<'a> {
    #[serde(rename = "URL")]
    url: &'a str,
}

impl BackendSpec {
    /// Create a spec with an instance id derived from the hostname and port
    pub fn new(app_name: &str, listen_ip: &str, listen_port: u16) -> Result<Self> {
        let id = format!("{}_{}", local_hostname()?, listen_port);
        Self::with_id(&id, app_name, listen_ip, listen_port)
    }

    /// Create a spec with an explicit instance id, e.g. a master group id
    pub fn with_id(id: &str, app_name: &str, listen_ip: &str, listen_port: u16) -> Result<Self> {
        Ok(Self {
            app_name: app_name.to_string(),
            instance_id: id.to_string(),
            url: endpoint_url(listen_ip, listen_port)?,
            settings: None,
        })
    }

    pub fn with_settings(mut self, settings: BackendSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn backend_key(&self, namespace: &str) -> String {
        keys::backend_key(namespace, &self.app_name)
    }

    pub fn server_key(&self, namespace: &str) -> String {
        keys::server_key(namespace, &self.app_name, &self.instance_id)
    }

    /// Backend type record, e.g. `{"Type":"http"}`
    pub fn type_record(&self) -> Result<String> {
        let record = TypeRecord {
            kind: "http",
            settings: self.settings.as_ref(),
        };
        Ok(serde_json::to_string(&record)?)
    }

    /// Backend server record, e.g. `{"URL":"http://10.0.0.5:8000"}`
    pub fn server_record(&self) -> Result<String> {
        Ok(serde_json::to_string(&ServerRecord { url: &self.url })?)
    }
}

/// Build the URL the proxy should use to reach a process listening on the
/// given address. A wildcard bind address is replaced by the first private
/// IPv4 address of the host.
pub fn endpoint_url(listen_ip: &str, listen_port: u16) -> Result<String> {
    match listen_ip.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => {
            let ip = private_ipv4_addrs()?
                .into_iter()
                .next()
                .ok_or(SpecError::NoPrivateAddress)?;
            Ok(format!("http://{}:{}", ip, listen_port))
        }
        Ok(IpAddr::V6(ip)) => Ok(format!("http://[{}]:{}", ip, listen_port)),
        // Plain IPv4 addresses and host names are used as given
        _ => Ok(format!("http://{}:{}", listen_ip, listen_port)),
    }
}
