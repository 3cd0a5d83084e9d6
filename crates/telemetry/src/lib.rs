pub mod aggregator;
pub mod buffer;
pub mod coalescer;
pub mod error;
pub mod session;
pub mod subscription;

pub use aggregator::{
    AggregatorConfig, ChannelInterest, ChannelSpec, Observation, TelemetryAggregator,
};
pub use buffer::{TimestampedValue, WindowedBuffer};
pub use coalescer::{DEFAULT_TICK, Notifier, Observer, ObserverId, UpdateCoalescer};
pub use error::SubscriptionError;
pub use session::TelemetrySession;
pub use subscription::{ChannelStats, Parser, Sink, SubscriptionManager, TeardownHook};
