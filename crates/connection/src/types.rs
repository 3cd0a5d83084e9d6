//! Public types for the connection manager.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tilestion_bus::{BusConnection, BusError, BusSubscription, MessageHandler};
use tilestion_protocol::channels::APP_NAME;

/// Connection state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and authenticated.
    Connected,
    /// The last connect attempt failed.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Login credentials. Only held for the duration of a connect attempt.
#[derive(Clone)]
pub struct Credentials {
    pub bus_url: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(bus_url: &str, username: &str, password: &str) -> Self {
        Self {
            bus_url: bus_url.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bus_url", &self.bus_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Who the manager is currently logged in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub bus_url: String,
    pub username: String,
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A login succeeded.
    LoggedIn(Identity),
    /// A login failed; carries the sanitized message.
    LoginFailed { message: String },
    /// The active connection was torn down.
    LoggedOut,
}

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Application part of the client name (`"{app_name}-{username}"`).
    pub app_name: String,
    /// Upper bound for each of drain and close during logout.
    pub teardown_timeout: Duration,
    /// Capacity of the event channel. Events beyond it are dropped.
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.into(),
            teardown_timeout: Duration::from_secs(5),
            event_capacity: 64,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The live bus connection owned by a [`ConnectionManager`](crate::ConnectionManager).
///
/// Clones are cheap borrowed views: they can subscribe, but draining and
/// closing stays with the manager. Each connection gets a process-unique id,
/// so two handles compare equal only if they refer to the same connection.
/// When the manager retires the connection (logout), [`is_retired`](Self::is_retired)
/// flips to `true` on every clone.
#[derive(Clone)]
pub struct ActiveConnection {
    id: u64,
    bus: Arc<dyn BusConnection>,
    retired: CancellationToken,
}

impl ActiveConnection {
    /// Wraps a freshly opened bus connection.
    pub fn new(bus: Arc<dyn BusConnection>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            bus,
            retired: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(
        &self,
        subject: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        self.bus.subscribe(subject, handler)
    }

    /// Whether the owner has retired this connection.
    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Token cancelled when the connection is retired.
    pub fn retired_token(&self) -> CancellationToken {
        self.retired.clone()
    }

    pub(crate) fn retire(&self) {
        self.retired.cancel();
    }

    pub(crate) fn bus(&self) -> &Arc<dyn BusConnection> {
        &self.bus
    }
}

impl PartialEq for ActiveConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActiveConnection {}

impl fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("id", &self.id)
            .field("retired", &self.is_retired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Idle.to_string(), "idle");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Error.to_string(), "error");
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("ws://localhost:8080", "alice", "hunter2");
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.app_name, "nats-client");
        assert_eq!(config.teardown_timeout, Duration::from_secs(5));
        assert_eq!(config.event_capacity, 64);
    }
}
