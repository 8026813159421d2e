//! Error types for the tunnel relay.
//!
//! `TunnelError` is what a waiting edge caller can observe; `ProtocolError`
//! describes a control-channel frame that could not be decoded.

use thiserror::Error;

/// Errors surfaced by registration, the session registry and correlation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// Missing or empty identifier at registration.
    #[error("registration rejected: {0}")]
    Registration(String),

    /// No live session for the resolved identifier.
    #[error("no tunnel registered for '{0}'")]
    SessionNotFound(String),

    /// The session was replaced by a newer registration under the same identifier.
    #[error("session for '{0}' was superseded by a new registration")]
    SessionSuperseded(String),

    /// Transport failure on an active session.
    #[error("control channel error: {0}")]
    Channel(String),

    /// No response within the configured bound.
    #[error("no response within {0} ms")]
    Timeout(u64),

    /// The session has no free pending slot; the caller may retry.
    #[error("session for '{0}' has no free request slot")]
    Busy(String),

    /// Malformed envelope on either direction.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TunnelError {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelError::Registration(_) => "registration",
            TunnelError::SessionNotFound(_) => "session_not_found",
            TunnelError::SessionSuperseded(_) => "superseded",
            TunnelError::Channel(_) => "channel",
            TunnelError::Timeout(_) => "timeout",
            TunnelError::Busy(_) => "busy",
            TunnelError::Protocol(_) => "protocol",
        }
    }

    /// Whether the caller can reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Busy(_))
    }
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        TunnelError::Protocol(err.to_string())
    }
}

/// Decode failures for control-channel frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame is not valid UTF-8")]
    NotUtf8,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has invalid value: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unexpected registration on an established session")]
    DuplicateRegistration,

    #[error("response without id while {0} requests are outstanding")]
    AmbiguousResponse(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_distinct() {
        let errors = [
            TunnelError::Registration("empty".into()),
            TunnelError::SessionNotFound("a".into()),
            TunnelError::SessionSuperseded("a".into()),
            TunnelError::Channel("reset".into()),
            TunnelError::Timeout(10),
            TunnelError::Busy("a".into()),
            TunnelError::Protocol("bad".into()),
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(TunnelError::Busy("a".into()).is_retryable());
        assert!(!TunnelError::Timeout(5).is_retryable());
        assert!(!TunnelError::Channel("x".into()).is_retryable());
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: TunnelError = ProtocolError::MissingField("client_id").into();
        assert_eq!(err.kind(), "protocol");
        assert!(err.to_string().contains("client_id"));
    }
}
