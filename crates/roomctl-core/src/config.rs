//! Ambient configuration: endpoint descriptors and per-client options.
//!
//! This module never touches disk or environment variables — the caller
//! builds a [`ClientOptions`] value and hands it to the registry or the
//! controller directly, the way the teacher's CLI builds a
//! `ControllerConfig` and core never reads configuration itself.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::SecretString;
use serde_json::Value;

/// Default port appended to an endpoint host when none is given.
pub const DEFAULT_PORT: u16 = 8000;

/// Hard ceiling on the connect-time handshake in the remote-auth path.
/// Unlike the PIN flow, remote auth has no retry loop, so a stalled
/// `authorized_message` must force a disconnect rather than hang forever.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-connection-attempt reconnect delay.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_millis(1000);

/// Default REST request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Watchdog deadline: no system-device "second state" tick within this
/// window triggers a `restart` call.
pub const WATCHDOG_DEADLINE: Duration = Duration::from_secs(15);

/// Where to find a controller. Either a literal `host[:port]`, or an
/// "auto" descriptor resolved from a query-string parameter with a
/// fallback default — the shape the registry's `get_or_create` accepts.
#[derive(Debug, Clone)]
pub enum EndpointDescriptor {
    Literal(String),
    Auto { param: String, default: String },
}

impl EndpointDescriptor {
    /// Resolve against a set of query-string-style parameters, falling
    /// back to `default` for the `Auto` variant.
    #[must_use]
    pub fn resolve(&self, params: &std::collections::HashMap<String, String>) -> String {
        let host = match self {
            Self::Literal(value) => value.clone(),
            Self::Auto { param, default } => params.get(param).cloned().unwrap_or_else(|| default.clone()),
        };
        if host.contains(':') {
            host
        } else {
            format!("{host}:{DEFAULT_PORT}")
        }
    }
}

/// A PIN can be a literal string or a supplier invoked lazily, only if
/// the controller rejects the default empty-PIN attempt.
#[derive(Clone)]
pub enum PinSource {
    Literal(SecretString),
    Supplier(Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>),
}

impl std::fmt::Debug for PinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(_) => write!(f, "PinSource::Literal(..)"),
            Self::Supplier(_) => write!(f, "PinSource::Supplier(..)"),
        }
    }
}

/// Per-client configuration options.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub reconnect_wait_time: Option<Duration>,
    pub http_request_timeout: Option<Duration>,
    pub disable_analytics: bool,
    pub remote_authorization: Option<Value>,
    pub pin: Option<PinSource>,
}

impl ClientOptions {
    #[must_use]
    pub fn reconnect_wait_time(&self) -> Duration {
        self.reconnect_wait_time.unwrap_or(DEFAULT_RECONNECT_WAIT)
    }

    #[must_use]
    pub fn http_request_timeout(&self) -> Duration {
        self.http_request_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT)
    }

    #[must_use]
    pub fn is_remote_auth(&self) -> bool {
        self.remote_authorization.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn literal_endpoint_gets_default_port() {
        let descriptor = EndpointDescriptor::Literal("192.168.1.5".to_owned());
        assert_eq!(
            descriptor.resolve(&Default::default()),
            "192.168.1.5:8000"
        );
    }

    #[test]
    fn literal_endpoint_keeps_explicit_port() {
        let descriptor = EndpointDescriptor::Literal("192.168.1.5:9000".to_owned());
        assert_eq!(
            descriptor.resolve(&Default::default()),
            "192.168.1.5:9000"
        );
    }

    #[test]
    fn auto_endpoint_falls_back_to_default() {
        let descriptor = EndpointDescriptor::Auto {
            param: "host".to_owned(),
            default: "127.0.0.1".to_owned(),
        };
        assert_eq!(descriptor.resolve(&Default::default()), "127.0.0.1:8000");
    }

    #[test]
    fn auto_endpoint_resolves_from_params() {
        let descriptor = EndpointDescriptor::Auto {
            param: "host".to_owned(),
            default: "127.0.0.1".to_owned(),
        };
        let mut params = std::collections::HashMap::new();
        params.insert("host".to_owned(), "10.0.0.9".to_owned());
        assert_eq!(descriptor.resolve(&params), "10.0.0.9:8000");
    }
}
