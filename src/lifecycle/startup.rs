//! Startup orchestration.
//!
//! # Responsibilities
//! - Turn a validated `HostConfig` into a configured `ApiHost`
//! - Add one protocol server per configured endpoint
//!
//! # Design Decisions
//! - Fail fast: an endpoint that cannot be added is fatal
//! - Servers are only added here; `ApiHost::start` binds them

use std::sync::Arc;
use std::time::Duration;

use crate::config::HostConfig;
use crate::net::NetUri;
use crate::rpc::{ApiHost, HostError, ServerSettings, TraceFilter};

/// Per-server settings derived from the config.
pub fn server_settings(config: &HostConfig) -> ServerSettings {
    ServerSettings {
        session_timeout: config.session.timeout(),
        framing: config.session.framing,
        max_frame_len: config.session.max_frame_len,
        use_session: config.session.use_session,
        udp_concurrency_ratio: config.session.udp_concurrency_ratio,
        request_timeout: Duration::from_secs(config.timeouts.request_secs),
    }
}

/// Build a host with every configured endpoint added (not yet started).
pub fn build_host(config: &HostConfig) -> Result<ApiHost, HostError> {
    let host = ApiHost::new(config.host.name.clone());
    host.set_settings(server_settings(config));
    host.set_reusable(config.host.reusable);
    host.core()
        .set_call_timeout(Duration::from_secs(config.host.call_timeout_secs));
    host.add_filter(Arc::new(TraceFilter));

    for endpoint in &config.host.endpoints {
        let uri = NetUri::parse(endpoint)?;
        if host.providers().get(uri.protocol.token()).is_none() {
            return Err(HostError::UnknownProtocol(uri.protocol.token().to_string()));
        }
        let server = host
            .add_uri(uri)
            .ok_or_else(|| HostError::Init(endpoint.clone()))?;
        tracing::debug!(server = %server.name(), endpoint = %endpoint, "Endpoint added");
    }

    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Framing;

    #[test]
    fn settings_follow_config() {
        let mut config = HostConfig::default();
        config.session.timeout_secs = 0;
        config.session.framing = Framing::Raw;
        config.timeouts.request_secs = 5;

        let settings = server_settings(&config);
        assert_eq!(settings.session_timeout, None);
        assert_eq!(settings.framing, Framing::Raw);
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn builds_one_server_per_endpoint() {
        let mut config = HostConfig::default();
        config.host.endpoints = vec![
            "tcp://127.0.0.1:0".to_string(),
            "ws://127.0.0.1:0/rpc".to_string(),
        ];
        config.host.reusable = true;

        let host = build_host(&config).unwrap();
        assert_eq!(host.servers().len(), 2);
        assert!(host.core().reusable());
        assert!(!host.is_active());
    }

    #[test]
    fn bad_endpoint_fails() {
        let mut config = HostConfig::default();
        config.host.endpoints = vec!["nonsense".to_string()];
        assert!(build_host(&config).is_err());
    }
}
