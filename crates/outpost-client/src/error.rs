//! Error types for the agent

use outpost_proto::{AclError, AdmissionRejection, SpecError};
use outpost_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the connection manager
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Admission rejected: {0}")]
    Rejected(AdmissionRejection),

    #[error("Invalid admission payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Max retry count reached after {attempts} attempt(s): {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("No servers configured")]
    NoServers,

    #[error("Failed to initialize watchdog state: {0}")]
    Watchdog(#[source] std::io::Error),
}

impl ClientError {
    /// Whether the reconnect loop should back off and try again
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.is_retryable(),
            ClientError::Rejected(rejection) => rejection.is_retryable(),
            ClientError::Serialization(_)
            | ClientError::MaxRetriesExceeded { .. }
            | ClientError::NoServers
            | ClientError::Watchdog(_) => false,
        }
    }
}

/// Errors from local tunnel endpoints
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel has {0} active connection(s)")]
    Busy(usize),

    #[error("Invalid ACL: {0}")]
    Acl(#[from] AclError),

    #[error("Invalid tunnel: {0}")]
    Spec(#[from] SpecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("could not resolve {0}")]
    Unresolvable(String),

    #[error("tunnel to {0} is not allowed")]
    NotAllowed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_proto::RejectionCode;

    #[test]
    fn test_client_error_retry_boundary() {
        let already = ClientError::Rejected(AdmissionRejection::from_payload(
            b"client is already connected",
        ));
        assert!(already.is_retryable());

        let unauthorized = ClientError::Rejected(AdmissionRejection {
            code: Some(RejectionCode::Unauthorized),
            message: "bad credentials".into(),
        });
        assert!(!unauthorized.is_retryable());

        assert!(ClientError::from(TransportError::Timeout).is_retryable());
        assert!(!ClientError::from(TransportError::UnsupportedProxy("socks4".into())).is_retryable());
    }

    #[test]
    fn test_busy_message_names_count() {
        assert_eq!(
            TunnelError::Busy(2).to_string(),
            "tunnel has 2 active connection(s)"
        );
    }
}
