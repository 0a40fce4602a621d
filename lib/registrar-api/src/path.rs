//! Route path conversion and predicate building

/// Convert a router path to the form the proxy understands.
///
/// Strips the pattern part of path variables (`/v2/{id:[0-9]+}` becomes
/// `/v2/{id}`) and then swaps curly brackets for angle brackets
/// (`/v2/{id}` becomes `/v2/<id>`). Applying it twice gives the same
/// result as applying it once.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars();
    let mut depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                depth += 1;
                out.push('<');
            }
            '}' => {
                depth = depth.saturating_sub(1);
                out.push('>');
            }
            ':' if depth > 0 => {
                // Skip the pattern up to the brace closing this variable,
                // which may itself contain balanced braces like `{3}`.
                let mut nested = 0usize;
                for p in chars.by_ref() {
                    match p {
                        '{' => nested += 1,
                        '}' if nested == 0 => {
                            depth -= 1;
                            out.push('>');
                            break;
                        }
                        '}' => nested -= 1,
                        _ => {}
                    }
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Build the frontend id from the methods and an already normalized path.
///
/// `["GET"]` + `/v2/<domain>/events` gives `get.v2.<domain>.events`.
pub fn frontend_id<S: AsRef<str>>(methods: &[S], normalized_path: &str) -> String {
    let methods: Vec<&str> = methods.iter().map(|m| m.as_ref()).collect();
    format!("{}{}", methods.join("."), normalized_path)
        .replace('/', ".")
        .to_lowercase()
}

/// Build the proxy route predicate for a host, method list and path.
///
/// A single method renders as `Method("GET")`, several as
/// `MethodRegexp("GET|POST")` in the order given. With no methods at all
/// the method clause is left out and every method matches.
pub fn route_predicate<S: AsRef<str>>(host: &str, methods: &[S], normalized_path: &str) -> String {
    let methods: Vec<String> = methods.iter().map(|m| m.as_ref().to_uppercase()).collect();
    let host = host.to_lowercase();

    match methods.as_slice() {
        [] => format!(r#"Host("{}") && Path("{}")"#, host, normalized_path),
        [method] => format!(
            r#"Host("{}") && Method("{}") && Path("{}")"#,
            host, method, normalized_path
        ),
        _ => format!(
            r#"Host("{}") && MethodRegexp("{}") && Path("{}")"#,
            host,
            methods.join("|"),
            normalized_path
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plain_path() {
        assert_eq!(normalize_path("/hello/kitty"), "/hello/kitty");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_normalize_variables() {
        assert_eq!(normalize_path("/v2/{domain}/events"), "/v2/<domain>/events");
        assert_eq!(normalize_path("/v2/{id:[0-9]+}"), "/v2/<id>");
        assert_eq!(
            normalize_path("/v2/{domain:.+}/events/{id:[a-z]+}"),
            "/v2/<domain>/events/<id>"
        );
    }

    #[test]
    fn test_normalize_nested_pattern_braces() {
        assert_eq!(normalize_path("/codes/{code:[0-9]{3}}/info"), "/codes/<code>/info");
    }

    #[test]
    fn test_normalize_keeps_colons_outside_variables() {
        assert_eq!(normalize_path("/v1/items:batch"), "/v1/items:batch");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for path in [
            "/v2/{domain}/events",
            "/v2/{id:[0-9]+}",
            "/codes/{code:[0-9]{3}}/info",
            "/v1/items:batch",
            "/a/{b",
            "/a/b}",
        ] {
            let once = normalize_path(path);
            assert_eq!(normalize_path(&once), once, "path {}", path);
        }
    }

    #[test]
    fn test_frontend_id() {
        assert_eq!(frontend_id(&["GET"], "/path/to/server"), "get.path.to.server");
        assert_eq!(frontend_id(&["put", "post"], "/pockemon/go"), "put.post.pockemon.go");
        assert_eq!(
            frontend_id(&["GET"], "/v2/<Domain>/events"),
            "get.v2.<domain>.events"
        );
        assert_eq!(frontend_id::<&str>(&[], "/hello"), ".hello");
    }

    #[test]
    fn test_frontend_id_is_deterministic() {
        let methods = ["GET", "POST"];
        assert_eq!(frontend_id(&methods, "/a/b"), frontend_id(&methods, "/a/b"));
    }

    #[test]
    fn test_single_method_predicate() {
        assert_eq!(
            route_predicate("example.com", &["get"], "/v2/<domain>/events"),
            r#"Host("example.com") && Method("GET") && Path("/v2/<domain>/events")"#
        );
    }

    #[test]
    fn test_multi_method_predicate_keeps_order() {
        assert_eq!(
            route_predicate("mailch.imp", &["put", "post"], "/pockemon/go"),
            r#"Host("mailch.imp") && MethodRegexp("PUT|POST") && Path("/pockemon/go")"#
        );
        assert_eq!(
            route_predicate("h", &["POST", "GET"], "/x"),
            r#"Host("h") && MethodRegexp("POST|GET") && Path("/x")"#
        );
    }

    #[test]
    fn test_predicate_lowercases_host() {
        assert_eq!(
            route_predicate("exAMPle.com", &["GET"], "/x"),
            r#"Host("example.com") && Method("GET") && Path("/x")"#
        );
    }

    #[test]
    fn test_predicate_without_methods() {
        assert_eq!(
            route_predicate::<&str>("h", &[], "/x"),
            r#"Host("h") && Path("/x")"#
        );
    }
}
