//! Narrow client interface to a publish/subscribe message bus.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::BusError;

/// A message delivered on a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }

    /// The payload as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

/// Callback invoked for every delivery on a subscription.
///
/// `Err` carries a transport-level failure for that delivery. Handlers may be
/// called from any thread, including a bus I/O thread.
pub type MessageHandler = Arc<dyn Fn(Result<BusMessage, BusError>) + Send + Sync>;

/// Options for a single connect attempt.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Server URL, e.g. `ws://localhost:8080`.
    pub url: String,
    /// Client name reported to the server.
    pub name: String,
    pub user: String,
    pub pass: String,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// Opens connections to a bus.
pub trait BusConnector: Send + Sync {
    /// Performs exactly one connect attempt.
    fn connect<'a>(
        &'a self,
        options: &'a ConnectOptions,
    ) -> BoxFuture<'a, Result<Arc<dyn BusConnection>, BusError>>;
}

/// A live connection to the bus.
pub trait BusConnection: Send + Sync {
    /// Subscribes `handler` to `subject`. Delivery starts immediately.
    fn subscribe(
        &self,
        subject: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Flushes in-flight deliveries and removes every subscription.
    fn drain(&self) -> BoxFuture<'_, Result<(), BusError>>;

    /// Closes the connection.
    fn close(&self) -> BoxFuture<'_, Result<(), BusError>>;
}

/// Handle owning one live subscription.
pub trait BusSubscription: Send {
    fn subject(&self) -> &str;

    /// Stops delivery. Calling it again, or after the connection closed, is
    /// allowed.
    fn unsubscribe(&mut self) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text() {
        let msg = BusMessage::new("a.b", r#"{"value":1}"#);
        assert_eq!(msg.text().unwrap(), r#"{"value":1}"#);

        let bad = BusMessage::new("a.b", vec![0xff_u8, 0xfe]);
        assert!(bad.text().is_err());
    }

    #[test]
    fn connect_options_debug_redacts_password() {
        let opts = ConnectOptions {
            url: "ws://localhost:8080".into(),
            name: "nats-client-alice".into(),
            user: "alice".into(),
            pass: "hunter2".into(),
        };
        let dbg = format!("{opts:?}");
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("hunter2"));
    }
}
