use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// A 3-axis reading (e.g. acceleration in g).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length of the vector.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Any value carried on a telemetry channel.
///
/// Serialized untagged, so a scalar is a bare JSON number and a vector is an
/// `{x, y, z}` object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Scalar(f64),
    Vector(Vector3),
}

impl TelemetryValue {
    /// The scalar reading, if this is a scalar.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Vector(_) => None,
        }
    }

    /// The vector reading, if this is a vector.
    pub fn as_vector(&self) -> Option<Vector3> {
        match self {
            Self::Scalar(_) => None,
            Self::Vector(v) => Some(*v),
        }
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vector3> for TelemetryValue {
    fn from(v: Vector3) -> Self {
        Self::Vector(v)
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => write!(f, "{v:.3}"),
            Self::Vector(v) => write!(f, "({:.3}, {:.3}, {:.3})", v.x, v.y, v.z),
        }
    }
}

/// Wire shape of every telemetry message: `{"value": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEnvelope<T> {
    pub value: Option<T>,
}

impl<T> ValueEnvelope<T> {
    pub fn new(value: T) -> Self {
        Self { value: Some(value) }
    }
}

impl<T: Serialize> ValueEnvelope<T> {
    /// Encodes the envelope as a JSON string, as published on the bus.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn parse_envelope<T: DeserializeOwned>(message: &str) -> Result<T, ParseError> {
    let envelope: ValueEnvelope<T> = serde_json::from_str(message)?;
    envelope.value.ok_or(ParseError::MissingValue)
}

/// Parses a payload carrying either a scalar or a vector.
pub fn parse_value(message: &str) -> Result<TelemetryValue, ParseError> {
    parse_envelope(message)
}

/// Parses a payload that must carry a scalar.
pub fn parse_scalar(message: &str) -> Result<f64, ParseError> {
    parse_envelope(message)
}

/// Parses a payload that must carry a 3-axis vector.
pub fn parse_vector(message: &str) -> Result<Vector3, ParseError> {
    parse_envelope(message)
}
