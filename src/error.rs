//! Error types for the sync engine
//!
//! Each component that can fail has its own error type so callers can decide
//! what to do: login failures go back to whoever asked for the login, session
//! fetch failures abort a single poll cycle, and transport failures never leave
//! the presence transport.

/// Login against the media server failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Failed to authenticate. Status: {status}. Reason: {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Media server unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed authentication response: {0}")]
    Malformed(String),
}

impl AuthError {
    /// HTTP status code returned by the server, if it answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Listing the active sessions failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionFetchError {
    #[error("No access token, login first")]
    NotAuthenticated,

    #[error("Session listing rejected. Status: {status}. Reason: {reason}")]
    Status { status: u16, reason: String },

    #[error("Media server unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed session listing: {0}")]
    Malformed(String),
}

impl SessionFetchError {
    /// True when the server rejected the token itself.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SessionFetchError::Status { status: 401 | 403, .. })
    }
}

/// Presence display unreachable or gone
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Presence display unavailable: {0}")]
    Unavailable(String),

    #[error("Presence channel closed: {0}")]
    Closed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_status() {
        let err = AuthError::Rejected {
            status: 401,
            reason: "Invalid username or password".to_string(),
        };
        assert_eq!(err.status(), Some(401));
        assert_eq!(AuthError::Unreachable("timeout".into()).status(), None);
    }

    #[test]
    fn test_auth_error_message_carries_reason() {
        let err = AuthError::Rejected {
            status: 500,
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to authenticate. Status: 500. Reason: boom");
    }

    #[test]
    fn test_session_fetch_unauthorized() {
        let unauthorized = SessionFetchError::Status {
            status: 401,
            reason: String::new(),
        };
        let forbidden = SessionFetchError::Status {
            status: 403,
            reason: String::new(),
        };
        let server_error = SessionFetchError::Status {
            status: 500,
            reason: String::new(),
        };
        assert!(unauthorized.is_unauthorized());
        assert!(forbidden.is_unauthorized());
        assert!(!server_error.is_unauthorized());
        assert!(!SessionFetchError::NotAuthenticated.is_unauthorized());
    }
}
