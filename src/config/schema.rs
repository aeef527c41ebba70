//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the testing
//! server. All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the testing server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (host, plain port, untrusted TLS port).
    pub listener: ListenerConfig,

    /// Static content root and TLS fixture locations.
    pub content: ContentConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ServerConfig {
    /// Configuration listening on `host:port` with the untrusted TLS listener disabled.
    pub fn new(listen_host: impl Into<String>, listen_port: u16) -> Self {
        let mut config = Self::default();
        config.listener.listen_host = listen_host.into();
        config.listener.listen_port = listen_port;
        config
    }

    /// Enable the untrusted TLS listener on `port` (0 = OS-assigned).
    pub fn with_bad_tls_listen_port(mut self, port: u16) -> Self {
        self.listener.bad_tls_listen_port = Some(port);
        self
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host (name or address) both listeners bind to.
    pub listen_host: String,

    /// Port of the plain HTTP listener. 0 lets the OS pick one.
    pub listen_port: u16,

    /// Port of the untrusted TLS listener. `None` disables it, 0 lets the OS pick.
    pub bad_tls_listen_port: Option<u16>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_host: "localhost".to_string(),
            listen_port: 0,
            bad_tls_listen_port: None,
        }
    }
}

/// Locations of the static content root and the TLS fixture files.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Directory served under `/static`.
    pub static_root: PathBuf,

    /// PEM private key presented by the untrusted TLS listener.
    pub tls_key_path: PathBuf,

    /// PEM certificate chain rooted at a CA no client trusts.
    pub tls_cert_path: PathBuf,
}

impl Default for ContentConfig {
    fn default() -> Self {
        let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures");
        Self {
            static_root: fixtures.join("static"),
            tls_key_path: fixtures.join("tls").join("private.key"),
            tls_cert_path: fixtures.join("tls").join("ca-untrusted-root.crt"),
        }
    }
}

/// Timeout configuration for the plain listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle socket timeout in seconds. Sockets without traffic for this long are closed.
    pub idle_secs: u64,

    /// TCP keep-alive idle interval in seconds.
    pub keepalive_secs: u64,

    /// How long `stop()` lets in-flight connections drain before force-closing them.
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            keepalive_secs: 10,
            shutdown_grace_ms: 2_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines instead of the human-readable format.
    pub json_logs: bool,

    /// Log every request on the plain listener.
    pub access_log: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            access_log: true,
        }
    }
}
