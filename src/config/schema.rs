//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Every section has defaults so a minimal file (or none) is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::Framing;

/// Root configuration for an RPC host.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Host identity and endpoints.
    pub host: HostSection,

    /// Session behaviour shared by socket servers.
    pub session: SessionConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Host identity and listening endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostSection {
    /// Name used in logs and `Api/Info`.
    pub name: String,

    /// Connection strings, e.g. `tcp://0.0.0.0:5500`, `ws://0.0.0.0:8081/ws`.
    pub endpoints: Vec<String>,

    /// Reuse controller instances per session.
    pub reusable: bool,

    /// Timeout for outbound calls, in seconds.
    pub call_timeout_secs: u64,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            name: "netrpc".to_string(),
            endpoints: vec![
                "tcp://0.0.0.0:5500".to_string(),
                "http://0.0.0.0:8080".to_string(),
            ],
            reusable: false,
            call_timeout_secs: 15,
        }
    }
}

/// Session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle timeout in seconds (0 = never).
    pub timeout_secs: u64,

    /// Keep a session table (needed for broadcast and lookups).
    pub use_session: bool,

    /// Stream framing.
    pub framing: Framing,

    /// Largest accepted frame in bytes.
    pub max_frame_len: usize,

    /// UDP receive loops per available core. A value that yields one loop
    /// keeps each peer's datagrams in arrival order.
    pub udp_concurrency_ratio: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1200,
            use_session: true,
            framing: Framing::LengthPrefixed,
            max_frame_len: 1024 * 1024,
            udp_concurrency_ratio: crate::net::server::DEFAULT_UDP_CONCURRENCY_RATIO,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// HTTP request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            [host]
            name = "demo"

            [session]
            framing = "raw"
            timeout_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.host.name, "demo");
        assert_eq!(config.host.endpoints.len(), 2);
        assert_eq!(config.session.framing, Framing::Raw);
        assert_eq!(config.session.timeout(), None);
        assert_eq!(config.timeouts.request_secs, 30);
    }
}
