//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate endpoints (parsable, known protocol)
//! - Validate value ranges (frame length, UDP ratio)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: HostConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::HostConfig;
use crate::net::NetUri;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("host.endpoints[{index}] `{endpoint}`: {reason}")]
    Endpoint {
        index: usize,
        endpoint: String,
        reason: String,
    },
    #[error("host.endpoints is empty")]
    NoEndpoints,
    #[error("session.max_frame_len must be greater than 0")]
    ZeroFrameLength,
    #[error("session.udp_concurrency_ratio must be positive, got {0}")]
    UdpRatio(f64),
    #[error("timeouts.request_secs must be greater than 0")]
    ZeroRequestTimeout,
    #[error("observability.metrics_address `{0}` is not a socket address")]
    MetricsAddress(String),
}

pub fn validate_config(config: &HostConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.host.endpoints.is_empty() {
        errors.push(ValidationError::NoEndpoints);
    }
    for (index, endpoint) in config.host.endpoints.iter().enumerate() {
        if let Err(e) = NetUri::parse(endpoint) {
            errors.push(ValidationError::Endpoint {
                index,
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            });
        }
    }

    if config.session.max_frame_len == 0 {
        errors.push(ValidationError::ZeroFrameLength);
    }
    let ratio = config.session.udp_concurrency_ratio;
    if !(ratio.is_finite() && ratio > 0.0) {
        errors.push(ValidationError::UdpRatio(ratio));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::ZeroRequestTimeout);
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
