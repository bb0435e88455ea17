//! DNS-rebinding protection for the HTTP transport.
//!
//! Validates `Host` and `Origin` headers against an allow-list of
//! `host[:port]` patterns and origin URIs before any request reaches the
//! endpoint. On by default, admitting loopback only.

/// Host/Origin validation policy.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// Disable validation entirely (reverse-proxy deployments).
    pub enabled: bool,
    /// Allowed `host[:port]` patterns; `*` matches any port.
    pub allowed_hosts: Vec<String>,
    /// Allowed origin URIs, compared scheme://host[:port] exact.
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: vec![
                "127.0.0.1:*".to_string(),
                "localhost:*".to_string(),
                "[::1]:*".to_string(),
            ],
            allowed_origins: vec![
                "http://127.0.0.1:*".to_string(),
                "http://localhost:*".to_string(),
            ],
        }
    }
}

impl SecurityPolicy {
    /// A policy that admits everything. For use behind trusted proxies.
    pub fn permissive() -> Self {
        Self {
            enabled: false,
            allowed_hosts: Vec::new(),
            allowed_origins: Vec::new(),
        }
    }

    /// Validate a `Host` header value.
    pub fn host_allowed(&self, host: &str) -> bool {
        if !self.enabled {
            return true;
        }
        self.allowed_hosts
            .iter()
            .any(|pattern| pattern_matches(pattern, host))
    }

    /// Validate an `Origin` header value. A missing origin is accepted
    /// (non-browser clients); a present one must match the allow-list.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|pattern| origin_matches(pattern, origin))
    }
}

/// Match `host[:port]` against a pattern where the port may be `*`.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    let (pattern_host, pattern_port) = split_host_port(pattern);
    let (value_host, value_port) = split_host_port(value);

    if !pattern_host.eq_ignore_ascii_case(value_host) {
        return false;
    }
    match pattern_port {
        Some("*") => true,
        Some(port) => value_port == Some(port),
        None => value_port.is_none(),
    }
}

fn origin_matches(pattern: &str, origin: &str) -> bool {
    let Some((pattern_scheme, pattern_rest)) = pattern.split_once("://") else {
        return false;
    };
    let Some((origin_scheme, origin_rest)) = origin.split_once("://") else {
        return false;
    };
    pattern_scheme.eq_ignore_ascii_case(origin_scheme)
        && pattern_matches(pattern_rest, origin_rest.trim_end_matches('/'))
}

/// Split `host[:port]`, keeping bracketed IPv6 literals intact.
fn split_host_port(value: &str) -> (&str, Option<&str>) {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let host = &value[..close + 2];
            let port = value[close + 2..].strip_prefix(':');
            return (host, port);
        }
    }
    match value.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (value, None),
    }
}
