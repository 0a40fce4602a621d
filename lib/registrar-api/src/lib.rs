//! Record types and key layout for publishing routes to the edge proxy
//!
//! This library turns an application's identity and routes into the exact
//! keys and JSON records the proxy control plane consumes:
//! - BackendSpec: one application process (type record + server record)
//! - FrontendSpec: one route (host + methods + path) and its middleware chain
//! - Middleware: typed middleware payloads rendered to JSON
//!
//! Everything here is pure and deterministic. No I/O happens outside of
//! hostname and interface discovery in [`net`].

pub mod backend;
pub mod error;
pub mod frontend;
pub mod keys;
pub mod middleware;
pub mod net;
pub mod path;

pub use backend::{BackendSettings, BackendSpec};
pub use error::{Result, SpecError};
pub use frontend::{FrontendSpec, DEFAULT_FAILOVER_PREDICATE};
pub use middleware::{
    CircuitBreaker, ConnLimit, Middleware, MiddlewarePayload, RateLimit, Rewrite,
    DEFAULT_MIDDLEWARE_PRIORITY,
};
