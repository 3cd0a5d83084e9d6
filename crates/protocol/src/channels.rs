//! Channel ids and bus subjects used by the default deployment.

/// Client application name; the connection name is `"{APP_NAME}-{username}"`.
pub const APP_NAME: &str = "nats-client";

/// Number of points retained per channel unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 100;

/// Channel id of the 3-axis vector stream.
pub const VECTOR_CHANNEL: &str = "vector";

/// Channel id of the scalar stream.
pub const VALUE_CHANNEL: &str = "value";

/// Bus subject carrying [`VECTOR_CHANNEL`] payloads.
pub const VECTOR_SUBJECT: &str = "telemetry.test.vector";

/// Bus subject carrying [`VALUE_CHANNEL`] payloads.
pub const VALUE_SUBJECT: &str = "telemetry.test.value";

/// Default `(channel id, bus subject)` pairs observed by a session.
pub const DEFAULT_CHANNELS: &[(&str, &str)] = &[
    (VECTOR_CHANNEL, VECTOR_SUBJECT),
    (VALUE_CHANNEL, VALUE_SUBJECT),
];
