use tilestion_bus::BusError;

/// A subscribe attempt failed; the channel is left without a subscription
/// until the next reconfiguration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("subscribe to {subject} failed: {source}")]
pub struct SubscriptionError {
    pub subject: String,
    #[source]
    pub source: BusError,
}
