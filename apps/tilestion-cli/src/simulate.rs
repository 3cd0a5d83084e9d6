//! Synthetic publisher for the default channels.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tilestion_bus::MemoryBus;
use tilestion_protocol::channels::{VALUE_SUBJECT, VECTOR_SUBJECT};
use tilestion_protocol::{TelemetryValue, ValueEnvelope, Vector3};

/// Values published at `step`: a sine on the scalar channel and a slowly
/// rotating unit vector tilted by gravity on the vector channel.
pub fn sample(step: u64) -> (TelemetryValue, TelemetryValue) {
    let t = step as f64 * 0.1;
    let scalar = TelemetryValue::Scalar(t.sin());
    let vector = TelemetryValue::Vector(Vector3::new(t.cos() * 0.2, t.sin() * 0.2, 1.0));
    (scalar, vector)
}

/// Publishes one sample per `interval` until `cancel` fires.
pub fn spawn(bus: MemoryBus, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut step: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (scalar, vector) = sample(step);
                    publish(&bus, VALUE_SUBJECT, scalar);
                    publish(&bus, VECTOR_SUBJECT, vector);
                    step += 1;
                }
            }
        }
        debug!(steps = step, "simulated publisher stopped");
    })
}

fn publish(bus: &MemoryBus, subject: &str, value: TelemetryValue) {
    match ValueEnvelope::new(value).to_json() {
        Ok(json) => {
            bus.publish(subject, json);
        }
        Err(e) => warn!(subject, error = %e, "failed to encode sample"),
    }
}
