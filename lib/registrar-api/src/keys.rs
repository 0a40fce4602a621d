//! Store key layout shared by every writer
//!
//! ```text
//! {namespace}/backends/{app}/backend
//! {namespace}/backends/{app}/servers/{instance}
//! {namespace}/frontends/{host}.{frontend_id}/frontend
//! {namespace}/frontends/{host}.{frontend_id}/middlewares/{middleware_id}
//! ```

/// Key of the static backend-type record
pub fn backend_key(namespace: &str, app: &str) -> String {
    format!("{}/backends/{}/backend", namespace, app)
}

/// Key of one backend server (instance) record
pub fn server_key(namespace: &str, app: &str, instance_id: &str) -> String {
    format!("{}/backends/{}/servers/{}", namespace, app, instance_id)
}

/// Prefix holding every server record of an app
pub fn servers_prefix(namespace: &str, app: &str) -> String {
    format!("{}/backends/{}/servers/", namespace, app)
}

/// Key of a frontend record
pub fn frontend_key(namespace: &str, host: &str, frontend_id: &str) -> String {
    format!("{}/frontends/{}.{}/frontend", namespace, host, frontend_id)
}

/// Key of one middleware attached to a frontend
pub fn middleware_key(
    namespace: &str,
    host: &str,
    frontend_id: &str,
    middleware_id: &str,
) -> String {
    format!(
        "{}/frontends/{}.{}/middlewares/{}",
        namespace, host, frontend_id, middleware_id
    )
}
