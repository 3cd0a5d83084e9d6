//! Error types for bus operations.

/// Errors reported by a bus client.
///
/// `Clone` so a single transport failure can be fanned out to every handler
/// subscribed on the affected subject.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Network(String),

    #[error("connection closed")]
    Closed,

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("operation timed out")]
    Timeout,
}

impl BusError {
    /// Whether the server rejected the client (bad credentials or a protocol
    /// violation) rather than the transport failing.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_error_display() {
        assert_eq!(BusError::Closed.to_string(), "connection closed");
        assert_eq!(
            BusError::Network("connection refused".into()).to_string(),
            "connection refused"
        );
        assert_eq!(
            BusError::Auth("authorization violation".into()).to_string(),
            "authentication failed: authorization violation"
        );
    }

    #[test]
    fn rejection_classification() {
        assert!(BusError::Auth("x".into()).is_rejection());
        assert!(BusError::Protocol("x".into()).is_rejection());
        assert!(!BusError::Network("x".into()).is_rejection());
        assert!(!BusError::Timeout.is_rejection());
    }
}
