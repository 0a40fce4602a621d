//! Middleware specs attached to frontends
//!
//! The proxy understands a fixed set of middleware kinds. Each kind is a
//! variant of [`MiddlewarePayload`] and renders to the JSON object the proxy
//! expects under the `Middleware` field of a middleware record.

use crate::{Result, SpecError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Priority assigned by the constructors. The registrar overwrites it with
/// the list position when records are written.
pub const DEFAULT_MIDDLEWARE_PRIORITY: i64 = 1;

pub const RATE_LIMIT_TYPE: &str = "ratelimit";
pub const RATE_LIMIT_ID: &str = "rl1";
pub const REWRITE_TYPE: &str = "rewrite";
pub const REWRITE_ID: &str = "rw1";
pub const CONN_LIMIT_TYPE: &str = "connlimit";
pub const CONN_LIMIT_ID: &str = "cl1";
pub const CIRCUIT_BREAKER_TYPE: &str = "cbreaker";
pub const CIRCUIT_BREAKER_ID: &str = "cb1";

/// Request rate limiting per variable (e.g. client IP or host)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RateLimit {
    pub variable: String,
    pub requests: u32,
    pub period_seconds: u32,
    pub burst: u32,
}

/// Request/response rewriting
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rewrite {
    pub regexp: String,
    pub replacement: String,
    pub rewrite_body: bool,
    pub redirect: bool,
}

/// Limit on simultaneous connections per variable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnLimit {
    pub variable: String,
    pub connections: u32,
}

/// Circuit breaker falling back to a canned response while a condition holds.
///
/// Durations are written as integer nanoseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CircuitBreaker {
    pub condition: String,
    pub fallback: String,
    #[serde(with = "nanos")]
    pub check_period: Duration,
    #[serde(with = "nanos")]
    pub fallback_duration: Duration,
    #[serde(with = "nanos")]
    pub recovery_duration: Duration,
    pub on_tripped: String,
    pub on_standby: String,
}

/// Type-specific body of a middleware record
#[derive(Clone, Debug, PartialEq)]
pub enum MiddlewarePayload {
    RateLimit(RateLimit),
    Rewrite(Rewrite),
    ConnLimit(ConnLimit),
    CircuitBreaker(CircuitBreaker),
    /// Any other middleware kind with an already structured payload
    Custom { kind: String, spec: Value },
    /// Any other middleware kind with a payload given as JSON text. The text
    /// is validated when the record is rendered.
    Raw { kind: String, json: String },
}

impl MiddlewarePayload {
    /// Type tag the proxy dispatches on
    pub fn kind(&self) -> &str {
        match self {
            Self::RateLimit(_) => RATE_LIMIT_TYPE,
            Self::Rewrite(_) => REWRITE_TYPE,
            Self::ConnLimit(_) => CONN_LIMIT_TYPE,
            Self::CircuitBreaker(_) => CIRCUIT_BREAKER_TYPE,
            Self::Custom { kind, .. } | Self::Raw { kind, .. } => kind,
        }
    }

    fn to_value(&self, id: &str) -> Result<Value> {
        let value = match self {
            Self::RateLimit(spec) => serde_json::to_value(spec)?,
            Self::Rewrite(spec) => serde_json::to_value(spec)?,
            Self::ConnLimit(spec) => serde_json::to_value(spec)?,
            Self::CircuitBreaker(spec) => serde_json::to_value(spec)?,
            Self::Custom { spec, .. } => spec.clone(),
            Self::Raw { json, .. } => {
                serde_json::from_str(json).map_err(|source| SpecError::InvalidMiddleware {
                    id: id.to_string(),
                    source,
                })?
            }
        };
        Ok(value)
    }
}

/// One middleware in a frontend's chain
#[derive(Clone, Debug, PartialEq)]
pub struct Middleware {
    pub id: String,
    pub priority: i64,
    pub payload: MiddlewarePayload,
}

#[derive(Serialize)]
struct MiddlewareRecord<'a> {
    #[serde(rename = "Type")]
    kind: &'a str,
    #[serde(rename = "Id")]
    id: &'a str,
    #[serde(rename = "Priority")]
    priority: i64,
    #[serde(rename = "Middleware")]
    middleware: Value,
}

impl Middleware {
    pub fn new(id: impl Into<String>, payload: MiddlewarePayload) -> Self {
        Self {
            id: id.into(),
            priority: DEFAULT_MIDDLEWARE_PRIORITY,
            payload,
        }
    }

    pub fn rate_limit(spec: RateLimit) -> Self {
        Self::new(RATE_LIMIT_ID, MiddlewarePayload::RateLimit(spec))
    }

    pub fn rewrite(spec: Rewrite) -> Self {
        Self::new(REWRITE_ID, MiddlewarePayload::Rewrite(spec))
    }

    pub fn conn_limit(spec: ConnLimit) -> Self {
        Self::new(CONN_LIMIT_ID, MiddlewarePayload::ConnLimit(spec))
    }

    pub fn circuit_breaker(spec: CircuitBreaker) -> Self {
        Self::new(CIRCUIT_BREAKER_ID, MiddlewarePayload::CircuitBreaker(spec))
    }

    pub fn custom(kind: impl Into<String>, id: impl Into<String>, spec: Value) -> Self {
        Self::new(
            id,
            MiddlewarePayload::Custom {
                kind: kind.into(),
                spec,
            },
        )
    }

    pub fn raw(kind: impl Into<String>, id: impl Into<String>, json: impl Into<String>) -> Self {
        Self::new(
            id,
            MiddlewarePayload::Raw {
                kind: kind.into(),
                json: json.into(),
            },
        )
    }

    /// Replace the default id, e.g. to attach two rate limits to one frontend
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    /// Render the middleware record at the given chain position. The
    /// position replaces whatever priority the middleware was built with.
    pub fn record(&self, position: usize) -> Result<String> {
        let record = MiddlewareRecord {
            kind: self.kind(),
            id: &self.id,
            priority: position as i64,
            middleware: self.payload.to_value(&self.id)?,
        };
        Ok(serde_json::to_string(&record)?)
    }
}

mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rate_limit_record() {
        let mw = Middleware::rate_limit(RateLimit {
            variable: "host".to_string(),
            requests: 1,
            period_seconds: 2,
            burst: 3,
        });
        assert_eq!(mw.priority, DEFAULT_MIDDLEWARE_PRIORITY);
        assert_eq!(
            mw.record(0).unwrap(),
            r#"{"Type":"ratelimit","Id":"rl1","Priority":0,"Middleware":{"Variable":"host","Requests":1,"PeriodSeconds":2,"Burst":3}}"#
        );
    }

    #[test]
    fn test_rewrite_record() {
        let mw = Middleware::rewrite(Rewrite {
            regexp: ".*".to_string(),
            replacement: "medved".to_string(),
            rewrite_body: false,
            redirect: true,
        });
        assert_eq!(
            mw.record(1).unwrap(),
            r#"{"Type":"rewrite","Id":"rw1","Priority":1,"Middleware":{"Regexp":".*","Replacement":"medved","RewriteBody":false,"Redirect":true}}"#
        );
    }

    #[test]
    fn test_conn_limit_record() {
        let mw = Middleware::conn_limit(ConnLimit {
            variable: "client.ip".to_string(),
            connections: 10,
        });
        assert_eq!(
            mw.record(2).unwrap(),
            r#"{"Type":"connlimit","Id":"cl1","Priority":2,"Middleware":{"Variable":"client.ip","Connections":10}}"#
        );
    }

    #[test]
    fn test_circuit_breaker_record_uses_nanoseconds() {
        let mw = Middleware::circuit_breaker(CircuitBreaker {
            condition: "con".to_string(),
            fallback: "fall".to_string(),
            check_period: Duration::from_secs(1),
            fallback_duration: Duration::from_millis(1),
            recovery_duration: Duration::from_secs(60),
            on_tripped: "trip".to_string(),
            on_standby: "by".to_string(),
        });
        assert_eq!(
            mw.record(0).unwrap(),
            r#"{"Type":"cbreaker","Id":"cb1","Priority":0,"Middleware":{"Condition":"con","Fallback":"fall","CheckPeriod":1000000000,"FallbackDuration":1000000,"RecoveryDuration":60000000000,"OnTripped":"trip","OnStandby":"by"}}"#
        );
    }

    #[test]
    fn test_custom_record() {
        let mw = Middleware::custom("bar", "bazz", json!("blah"));
        assert_eq!(
            mw.record(0).unwrap(),
            r#"{"Type":"bar","Id":"bazz","Priority":0,"Middleware":"blah"}"#
        );
    }

    #[test]
    fn test_position_overrides_priority() {
        let mut mw = Middleware::custom("T1", "Id1", json!({}));
        mw.priority = 7;
        assert!(mw.record(3).unwrap().contains(r#""Priority":3"#));
    }

    #[test]
    fn test_raw_payload_is_validated() {
        let ok = Middleware::raw("auth", "a1", r#"{"Realm":"api"}"#);
        assert_eq!(
            ok.record(0).unwrap(),
            r#"{"Type":"auth","Id":"a1","Priority":0,"Middleware":{"Realm":"api"}}"#
        );

        let broken = Middleware::raw("auth", "a2", "{not json");
        let err = broken.record(0).unwrap_err();
        assert!(err.is_serialization());
        assert!(err.to_string().contains("a2"));
    }

    #[test]
    fn test_with_id() {
        let mw = Middleware::rate_limit(RateLimit {
            variable: "client.ip".to_string(),
            requests: 5,
            period_seconds: 1,
            burst: 5,
        })
        .with_id("rl2");
        assert_eq!(mw.id, "rl2");
        assert_eq!(mw.kind(), RATE_LIMIT_TYPE);
    }

    #[test]
    fn test_circuit_breaker_deserialize() {
        let cb: CircuitBreaker = serde_json::from_str(
            r#"{"Condition":"c","Fallback":"f","CheckPeriod":1000,"FallbackDuration":0,"RecoveryDuration":5,"OnTripped":"","OnStandby":""}"#,
        )
        .unwrap();
        assert_eq!(cb.check_period, Duration::from_micros(1));
        assert_eq!(cb.recovery_duration, Duration::from_nanos(5));
    }
}
