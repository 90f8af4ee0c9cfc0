use thiserror::Error;

/// Errors surfaced by [`crate::ConnectionManager::connect`].
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("No access token is available. Log in before starting the balance feed.")]
    AuthError,
    #[error("Authentication failed and the session has been logged out. {0}")]
    AuthenticationFailed(String),
    #[error("Transient connection error. {0}")]
    TransientConnectError(#[from] TransportError),
    #[error("Could not connect to the balance hub after {attempts} attempts. Last error: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: TransportError },
    #[error("Could not {action} group {group}. {reason}")]
    GroupOperationError { action: &'static str, group: String, reason: String },
}

/// Errors reported by a hub transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("The hub rejected the access token (HTTP {0})")]
    Unauthorized(u16),
    #[error("Network error. {0}")]
    Network(String),
    #[error("Hub protocol error. {0}")]
    Protocol(String),
    #[error("Hub invocation failed. {0}")]
    Invocation(String),
    #[error("Could not obtain an access token. {0}")]
    Token(String),
    #[error("The hub connection is closed")]
    Closed,
}

impl TransportError {
    /// True for failures with 401/403 semantics, which call for a token refresh rather than a retry.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    pub fn from_status(status: u16, message: &str) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(status),
            _ => Self::Network(format!("HTTP {status}. {message}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("No refresh token is available")]
    MissingRefreshToken,
    #[error("The refresh token was rejected. {0}")]
    Rejected(String),
    #[error("Could not reach the token service. {0}")]
    Network(String),
    #[error("The token service returned an invalid response. {0}")]
    InvalidResponse(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(TransportError::from_status(401, "").is_auth_error());
        assert!(TransportError::from_status(403, "").is_auth_error());
        let e = TransportError::from_status(503, "busy");
        assert!(!e.is_auth_error());
        assert_eq!(e.to_string(), "Network error. HTTP 503. busy");
    }
}
