//! Bus connection lifecycle for the telemetry engine.
//!
//! [`ConnectionManager`] owns at most one live bus connection and drives the
//! `Idle → Connecting → Connected | Error` state machine through
//! [`login`](ConnectionManager::login) and [`logout`](ConnectionManager::logout).

pub mod error;
pub mod manager;
pub mod types;

pub use error::{ConnectionError, LOGIN_REJECTED_MESSAGE};
pub use manager::ConnectionManager;
pub use types::{
    ActiveConnection, ConnectionConfig, ConnectionEvent, ConnectionState, Credentials, Identity,
};
