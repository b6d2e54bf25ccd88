//! RPC fault types.

use crate::net::{NetError, UriError};

/// A remote fault: numeric code plus message.
///
/// Code 0 means success on the wire, so a fault never carries it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ApiError {
    pub code: i32,
    pub message: String,
}

impl ApiError {
    /// Generic failure.
    pub const GENERIC: i32 = 1;
    /// Unknown action.
    pub const NOT_FOUND: i32 = 404;
    /// Call timed out waiting for the correlated reply.
    pub const TIMEOUT: i32 = 408;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        let code = if code == 0 { Self::GENERIC } else { code };
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(Self::GENERIC, message)
    }

    pub fn not_found(action: &str) -> Self {
        Self::new(Self::NOT_FOUND, format!("action `{}` not found", action))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::generic(e.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self::generic(e.to_string())
    }
}

impl From<NetError> for ApiError {
    fn from(e: NetError) -> Self {
        Self::generic(e.to_string())
    }
}

/// Failures while adding or starting protocol servers.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid endpoint: {0}")]
    Uri(#[from] UriError),
    #[error("no provider for protocol `{0}`")]
    UnknownProtocol(String),
    #[error("server `{0}` failed to initialise")]
    Init(String),
    #[error("server `{name}` failed to start: {reason}")]
    Start { name: String, reason: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_code_is_normalised() {
        assert_eq!(ApiError::new(0, "boom").code, ApiError::GENERIC);
        assert_eq!(ApiError::new(42, "boom").code, 42);
    }

    #[test]
    fn display_carries_code() {
        assert_eq!(ApiError::new(42, "nope").to_string(), "[42] nope");
    }
}
