//! Frontend (route) specs

use crate::keys;
use crate::path::{frontend_id, normalize_path, route_predicate};
use crate::{Middleware, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Failover predicate written on every frontend
pub const DEFAULT_FAILOVER_PREDICATE: &str =
    "(IsNetworkError() || ResponseCode() == 503) && Attempts() <= 2";

/// A route from a host + methods + path to a backend
#[derive(Clone, Debug, PartialEq)]
pub struct FrontendSpec {
    /// Deterministic id derived from methods and path
    pub id: String,
    /// Lower-cased host the route is served on
    pub host: String,
    /// App name of the backend the route points at
    pub backend_id: String,
    /// Proxy route predicate
    pub route: String,
    pub failover_predicate: String,
    /// Middleware chain, applied in list order
    pub middlewares: Vec<Middleware>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FrontendSettings<'a> {
    failover_predicate: &'a str,
    pass_host_header: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FrontendRecord<'a> {
    #[serde(rename = "Type")]
    kind: &'a str,
    backend_id: &'a str,
    route: &'a str,
    settings: FrontendSettings<'a>,
}

impl FrontendSpec {
    pub fn new<S: AsRef<str>>(
        backend_id: &str,
        host: &str,
        path: &str,
        methods: &[S],
        middlewares: Vec<Middleware>,
    ) -> Self {
        let path = normalize_path(path);
        let host = host.to_lowercase();

        Self {
            id: frontend_id(methods, &path),
            route: route_predicate(&host, methods, &path),
            host,
            backend_id: backend_id.to_string(),
            failover_predicate: DEFAULT_FAILOVER_PREDICATE.to_string(),
            middlewares,
        }
    }

    /// Store key of the frontend record
    pub fn key(&self, namespace: &str) -> String {
        keys::frontend_key(namespace, &self.host, &self.id)
    }

    /// Store key of one of this frontend's middleware records
    pub fn middleware_key(&self, namespace: &str, middleware: &Middleware) -> String {
        keys::middleware_key(namespace, &self.host, &self.id, &middleware.id)
    }

    /// The frontend record as written to the store
    pub fn record(&self) -> Result<String> {
        let record = FrontendRecord {
            kind: "http",
            backend_id: &self.backend_id,
            route: &self.route,
            settings: FrontendSettings {
                failover_predicate: &self.failover_predicate,
                pass_host_header: true,
            },
        };
        Ok(serde_json::to_string(&record)?)
    }

    /// Middleware records paired with their ids, priorities set to the
    /// position in the chain.
    pub fn middleware_records(&self) -> Result<Vec<(&Middleware, String)>> {
        self.middlewares
            .iter()
            .enumerate()
            .map(|(position, mw)| Ok((mw, mw.record(position)?)))
            .collect()
    }

    /// Stable hash of everything this frontend writes, for change detection
    pub fn hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.backend_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.host.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.id.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.record()?.as_bytes());
        for (_, record) in self.middleware_records()? {
            hasher.update(b"\n");
            hasher.update(record.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
