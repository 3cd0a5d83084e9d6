//! Payload types shared by the Tilestion telemetry pipeline.
//!
//! Telemetry arrives as JSON documents of the shape `{"value": ...}` where the
//! value is either a number or a 3-axis vector.

pub mod channels;
pub mod error;
pub mod telemetry;

pub use error::ParseError;
pub use telemetry::{
    TelemetryValue, ValueEnvelope, Vector3, parse_scalar, parse_value, parse_vector,
};
