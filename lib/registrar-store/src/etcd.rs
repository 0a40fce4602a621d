//! etcd v3 client over the JSON/HTTP gateway
//!
//! Keys and values travel base64-encoded. 64-bit integers may come back as
//! JSON strings or numbers depending on the gateway version, so responses
//! accept both.

use crate::store::{Connector, KeepAliveAck, KeepAliveStream, KeyValue, KvStore, LeaseGrant, LeaseId};
use crate::{Result, StoreError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS settings for the etcd connection
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Accept any server certificate
    pub insecure_skip_verify: bool,
    /// PEM file with the CA that signed the server certificate
    pub ca_file: Option<String>,
    /// PEM client certificate, used together with `key_file`
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

/// Connection settings for an etcd cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
}

/// Opens [`EtcdStore`] sessions, trying each configured endpoint in order
#[derive(Clone, Debug)]
pub struct EtcdConnector {
    config: EtcdConfig,
    client: reqwest::Client,
}

impl EtcdConnector {
    pub fn new(config: EtcdConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(StoreError::InvalidConfig("no etcd endpoints configured".to_string()));
        }
        let client = build_client(&config)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &EtcdConfig {
        &self.config
    }

    async fn open(&self, endpoint: &str) -> Result<EtcdStore> {
        let mut store = EtcdStore {
            client: self.client.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: None,
        };

        match (&self.config.username, &self.config.password) {
            (Some(name), Some(password)) => {
                let resp: AuthResponse = store
                    .call("/v3/auth/authenticate", &json!({ "name": name, "password": password }))
                    .await?;
                store.token = Some(resp.token);
            }
            _ => {
                let _: Value = store.call("/v3/maintenance/status", &json!({})).await?;
            }
        }
        Ok(store)
    }
}

#[async_trait::async_trait]
impl Connector for EtcdConnector {
    async fn connect(&self) -> Result<Arc<dyn KvStore>> {
        let mut last_error = None;
        for endpoint in &self.config.endpoints {
            match self.open(endpoint).await {
                Ok(store) => {
                    debug!("Connected to etcd at {}", endpoint);
                    return Ok(Arc::new(store));
                }
                Err(e) => {
                    warn!("Failed to connect to etcd at {}: {}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }
        Err(StoreError::Unavailable(match last_error {
            Some(e) => format!("all etcd endpoints failed, last error: {}", e),
            None => "no etcd endpoints configured".to_string(),
        }))
    }
}

fn build_client(config: &EtcdConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT);

    if let Some(tls) = &config.tls {
        if tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_file) = &tls.ca_file {
            let pem = read_file(ca_file)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                StoreError::InvalidConfig(format!("invalid CA certificate {}: {}", ca_file, e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        match (&tls.cert_file, &tls.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let mut pem = read_file(cert_file)?;
                pem.push(b'\n');
                pem.extend(read_file(key_file)?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                    StoreError::InvalidConfig(format!("invalid client certificate {}: {}", cert_file, e))
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(StoreError::InvalidConfig(
                    "TLS client certificate and key must be given together".to_string(),
                ))
            }
        }
    }

    builder
        .build()
        .map_err(|e| StoreError::InvalidConfig(format!("failed to build HTTP client: {}", e)))
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| StoreError::InvalidConfig(format!("failed to read {}: {}", path, e)))
}

/// One authenticated session against a single etcd endpoint
#[derive(Clone, Debug)]
pub struct EtcdStore {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl EtcdStore {
    async fn call<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.call_within(path, body, REQUEST_TIMEOUT).await
    }

    async fn call_within<T: DeserializeOwned>(&self, path: &str, body: &Value, limit: Duration) -> Result<T> {
        let mut request = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .timeout(limit)
            .json(body);
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, token.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        // Streaming endpoints answer with one JSON object per line.
        let first = text.lines().find(|line| !line.trim().is_empty()).unwrap_or("{}");
        Ok(serde_json::from_str(first)?)
    }

    async fn range(&self, key: &str, range_end: Option<Vec<u8>>) -> Result<Vec<KeyValue>> {
        let mut body = json!({ "key": encode(key.as_bytes()) });
        if let Some(end) = range_end {
            body["range_end"] = Value::String(encode(&end));
        }
        let resp: RangeResponse = self.call("/v3/kv/range", &body).await?;
        resp.kvs.into_iter().map(RawKeyValue::decode).collect()
    }

    async fn delete_range(&self, key: &str, range_end: Option<Vec<u8>>) -> Result<u64> {
        let mut body = json!({ "key": encode(key.as_bytes()) });
        if let Some(end) = range_end {
            body["range_end"] = Value::String(encode(&end));
        }
        let resp: DeleteRangeResponse = self.call("/v3/kv/deleterange", &body).await?;
        Ok(resp.deleted.max(0) as u64)
    }

    /// Run a single-compare transaction that puts `value` on success.
    /// A lease granted for the put is revoked when the compare fails.
    async fn txn_put(&self, compare: Value, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut put = json!({ "key": encode(key.as_bytes()), "value": encode(value.as_bytes()) });
        let lease = match ttl {
            Some(ttl) => Some(self.grant(ttl).await?.id),
            None => None,
        };
        if let Some(id) = lease {
            put["lease"] = json!(id);
        }
        let body = json!({
            "compare": [compare],
            "success": [{ "request_put": put }],
        });

        let succeeded = match self.call::<TxnResponse>("/v3/kv/txn", &body).await {
            Ok(resp) => resp.succeeded,
            Err(e) => {
                self.release(lease).await;
                return Err(e);
            }
        };
        if !succeeded {
            self.release(lease).await;
        }
        Ok(succeeded)
    }

    async fn release(&self, lease: Option<LeaseId>) {
        if let Some(id) = lease {
            if let Err(e) = self.revoke(id).await {
                debug!("Failed to release unused lease {}: {}", id, e);
            }
        }
    }

    async fn keep_alive_once(&self, lease: LeaseId, limit: Duration) -> Result<KeepAliveAck> {
        let resp: KeepAliveResponse = self
            .call_within("/v3/lease/keepalive", &json!({ "ID": lease }), limit)
            .await?;
        match resp.result {
            Some(result) if result.ttl > 0 => Ok(KeepAliveAck {
                id: lease,
                ttl: Duration::from_secs(result.ttl as u64),
            }),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }
}

fn lease_error(lease: LeaseId, err: StoreError) -> StoreError {
    match &err {
        StoreError::Status { body, .. } if body.contains("lease not found") => {
            StoreError::LeaseNotFound(lease)
        }
        _ => err,
    }
}

#[async_trait::async_trait]
impl KvStore for EtcdStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut body = json!({ "key": encode(key.as_bytes()), "value": encode(value.as_bytes()) });
        if let Some(id) = lease {
            body["lease"] = json!(id);
        }
        let result: Result<Value> = self.call("/v3/kv/put", &body).await;
        match (result, lease) {
            (Ok(_), _) => Ok(()),
            (Err(e), Some(id)) => Err(lease_error(id, e)),
            (Err(e), None) => Err(e),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.range(key, None).await?.into_iter().next())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.range(prefix, Some(prefix_range_end(prefix.as_bytes()))).await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.delete_range(key, None).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.delete_range(prefix, Some(prefix_range_end(prefix.as_bytes()))).await
    }

    async fn grant(&self, ttl: Duration) -> Result<LeaseGrant> {
        let secs = ttl.as_secs().max(1);
        let resp: GrantResponse = self.call("/v3/lease/grant", &json!({ "TTL": secs })).await?;
        if !resp.error.is_empty() {
            return Err(StoreError::Unavailable(format!("lease grant failed: {}", resp.error)));
        }
        Ok(LeaseGrant {
            id: resp.id,
            ttl: Duration::from_secs(resp.ttl.max(0) as u64),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let first = self.keep_alive_once(lease, REQUEST_TIMEOUT).await?;
        // Each refresh must answer within one period or the stream fails.
        let period = (first.ttl / 3).max(Duration::from_secs(1));
        let ticker = time::interval(period);

        // The first tick fires immediately and refreshes again, which keeps
        // the stream shape the same for every caller.
        let stream = futures::stream::unfold(
            Some((self.clone(), ticker)),
            move |state| async move {
                let (store, mut ticker) = state?;
                ticker.tick().await;
                match store.keep_alive_once(lease, period).await {
                    Ok(ack) => Some((Ok(ack), Some((store, ticker)))),
                    Err(err) => Some((Err(err), None)),
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let _: Value = self
            .call("/v3/lease/revoke", &json!({ "ID": lease }))
            .await
            .map_err(|e| lease_error(lease, e))?;
        debug!("Revoked etcd lease {}", lease);
        Ok(())
    }

    async fn time_to_live(&self, lease: LeaseId) -> Result<Option<Duration>> {
        let resp: TimeToLiveResponse = self.call("/v3/lease/timetolive", &json!({ "ID": lease })).await?;
        if resp.ttl < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_secs(resp.ttl as u64)))
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let compare = json!({
            "key": encode(key.as_bytes()),
            "target": "CREATE",
            "result": "EQUAL",
            "create_revision": 0,
        });
        self.txn_put(compare, key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let compare = json!({
            "key": encode(key.as_bytes()),
            "target": "VALUE",
            "result": "EQUAL",
            "value": encode(expected.as_bytes()),
        });
        self.txn_put(compare, key, value, ttl).await
    }
}

fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode(text: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(text)
        .map_err(|e| StoreError::Decode(format!("invalid base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Decode(format!("invalid UTF-8: {}", e)))
}

/// End of the key range covering every key that starts with `prefix`
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: the range runs to the end of the keyspace.
    vec![0]
}

/// Accept an int64 encoded either as a JSON number or a string
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: String,
}

#[derive(Deserialize)]
struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "int64")]
    lease: i64,
    #[serde(default, deserialize_with = "int64")]
    mod_revision: i64,
}

impl RawKeyValue {
    fn decode(self) -> Result<KeyValue> {
        Ok(KeyValue {
            key: decode(&self.key)?,
            value: decode(&self.value)?,
            lease: (self.lease != 0).then_some(self.lease),
            mod_revision: self.mod_revision,
        })
    }
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
}

#[derive(Deserialize)]
struct DeleteRangeResponse {
    #[serde(default, deserialize_with = "int64")]
    deleted: i64,
}

#[derive(Deserialize)]
struct GrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "int64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
}

#[derive(Deserialize)]
struct KeepAliveResponse {
    result: Option<KeepAliveResult>,
}

#[derive(Deserialize)]
struct TimeToLiveResponse {
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
}

#[derive(Deserialize)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
}
