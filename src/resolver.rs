//! Endpoint → WebSocket URL resolution.

use crate::ws::http_to_ws_scheme;

/// Maps logical endpoint identifiers to fully qualified WebSocket URLs.
///
/// The base is either an explicit real-time override or is derived from the
/// application origin (scheme upgraded to `ws`/`wss`, path dropped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResolver {
    base: String,
}

impl EndpointResolver {
    /// Build a resolver from an origin and an optional real-time override.
    ///
    /// `origin` is an `http(s)://host[:port]` URL; any path on it is ignored.
    /// `override_url` wins when set and non-blank.
    #[must_use]
    pub fn new(origin: &str, override_url: Option<&str>) -> Self {
        let base = match override_url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => http_to_ws_scheme(url),
            None => origin_base(origin),
        };
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Base URL that endpoints are appended to.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Resolve `endpoint` to a full URL.
    ///
    /// Exactly one `/` separates base and endpoint. A malformed endpoint
    /// yields an unusable URL; the connect attempt reports it.
    #[must_use]
    pub fn resolve(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base, endpoint.trim_start_matches('/'))
    }

    /// Whether `endpoint` names a channel at all (non-blank).
    #[must_use]
    pub fn is_valid_endpoint(endpoint: &str) -> bool {
        !endpoint.trim().is_empty()
    }
}

/// Scheme + authority of `origin`, upgraded to a WebSocket scheme.
fn origin_base(origin: &str) -> String {
    let ws = http_to_ws_scheme(origin.trim());
    match ws.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            format!("{scheme}://{host}")
        }
        None => ws,
    }
}
