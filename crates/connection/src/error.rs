//! Error types for the connection manager.

use tilestion_bus::BusError;

/// Message shown for rejected logins. Never includes the server's own text.
pub const LOGIN_REJECTED_MESSAGE: &str = "Login failed. Check connection and credentials.";

/// Why a login did not produce a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The server refused the credentials or the protocol exchange.
    #[error("Login failed. Check connection and credentials.")]
    Rejected,

    /// Any other connect failure, with its underlying message.
    #[error("{0}")]
    Unavailable(String),

    /// A logout happened while the connect attempt was still in flight.
    #[error("login cancelled by logout")]
    Cancelled,
}

impl From<BusError> for ConnectionError {
    fn from(err: BusError) -> Self {
        if err.is_rejection() {
            Self::Rejected
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_generic() {
        let err = ConnectionError::from(BusError::Auth("authorization violation".into()));
        assert_eq!(err, ConnectionError::Rejected);
        assert_eq!(err.to_string(), LOGIN_REJECTED_MESSAGE);
        assert!(!err.to_string().contains("authorization violation"));

        let err = ConnectionError::from(BusError::Protocol("bad handshake".into()));
        assert_eq!(err.to_string(), LOGIN_REJECTED_MESSAGE);
    }

    #[test]
    fn other_failures_keep_their_message() {
        let err = ConnectionError::from(BusError::Network("connection refused".into()));
        assert_eq!(err.to_string(), "connection refused");

        let err = ConnectionError::from(BusError::Timeout);
        assert_eq!(err.to_string(), "operation timed out");
    }
}
