//! Single-subject subscription lifecycle.
//!
//! A [`SubscriptionManager`] keeps at most one live bus subscription for its
//! subject and reconciles it against the current connection. Every delivery
//! passes through a gate: once the subscription is torn down (or the owning
//! connection is retired) no further value reaches the sink, even if the bus
//! still has the old handler queued.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tilestion_bus::{BusError, BusMessage, BusSubscription, MessageHandler};
use tilestion_connection::ActiveConnection;
use tilestion_protocol::ParseError;

use crate::error::SubscriptionError;

/// Decodes one message body into a value.
pub type Parser<T> = Arc<dyn Fn(&str) -> Result<T, ParseError> + Send + Sync>;

/// Receives every successfully parsed value, in delivery order.
pub type Sink<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Runs after a live subscription is torn down and its gate closed.
pub type TeardownHook = Arc<dyn Fn() + Send + Sync>;

/// Per-channel delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Deliveries that passed the gate, including failed ones.
    pub received: u64,
    /// Values handed to the sink.
    pub accepted: u64,
    pub parse_errors: u64,
    pub transport_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    accepted: AtomicU64,
    parse_errors: AtomicU64,
    transport_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

struct ActiveSubscription {
    connection_id: u64,
    subject: String,
    handle: Box<dyn BusSubscription>,
    // `true` while deliveries may reach the sink.
    gate: Arc<Mutex<bool>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the subscription for one subject.
pub struct SubscriptionManager<T> {
    subject: String,
    parser: Parser<T>,
    sink: Sink<T>,
    counters: Arc<Counters>,
    active: Option<ActiveSubscription>,
    on_teardown: Option<TeardownHook>,
}

impl<T: Send + 'static> SubscriptionManager<T> {
    pub fn new(subject: impl Into<String>, parser: Parser<T>, sink: Sink<T>) -> Self {
        Self {
            subject: subject.into(),
            parser,
            sink,
            counters: Arc::new(Counters::default()),
            active: None,
            on_teardown: None,
        }
    }

    /// Call `hook` every time a live subscription is torn down, once no
    /// further value can reach the sink.
    pub fn on_teardown<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_teardown = Some(Arc::new(hook));
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Whether a live subscription exists.
    pub fn is_subscribed(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the connection the live subscription belongs to.
    pub fn connection_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.connection_id)
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    /// Reconcile against `connection`.
    ///
    /// Without a connection (or with a retired one) any live subscription is
    /// torn down. With a connection, the subscription is kept if it already
    /// matches the connection and subject, otherwise the old one is torn down
    /// before the new one is created. A failed subscribe leaves the manager
    /// unsubscribed; the next call retries.
    pub fn sync(&mut self, connection: Option<&ActiveConnection>) -> Result<(), SubscriptionError> {
        let Some(connection) = connection.filter(|c| !c.is_retired()) else {
            self.teardown();
            return Ok(());
        };

        let current = self
            .active
            .as_ref()
            .is_some_and(|a| a.connection_id == connection.id() && a.subject == self.subject);
        if current {
            return Ok(());
        }

        self.teardown();
        self.subscribe(connection)
    }

    /// Change the subject, then reconcile against `connection`.
    pub fn set_subject(
        &mut self,
        subject: impl Into<String>,
        connection: Option<&ActiveConnection>,
    ) -> Result<(), SubscriptionError> {
        self.subject = subject.into();
        self.sync(connection)
    }

    fn subscribe(&mut self, connection: &ActiveConnection) -> Result<(), SubscriptionError> {
        let gate = Arc::new(Mutex::new(true));
        let handler = self.handler(Arc::clone(&gate), connection.retired_token());

        let handle = connection
            .subscribe(&self.subject, handler)
            .map_err(|source| {
                warn!(subject = %self.subject, error = %source, "subscribe failed");
                SubscriptionError {
                    subject: self.subject.clone(),
                    source,
                }
            })?;

        info!(subject = %self.subject, connection = connection.id(), "subscribed");
        self.active = Some(ActiveSubscription {
            connection_id: connection.id(),
            subject: self.subject.clone(),
            handle,
            gate,
        });
        Ok(())
    }

    fn handler(&self, gate: Arc<Mutex<bool>>, retired: CancellationToken) -> MessageHandler {
        let subject = self.subject.clone();
        let parser = Arc::clone(&self.parser);
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);

        Arc::new(move |delivery: Result<BusMessage, BusError>| {
            let open = lock(&gate);
            if !*open || retired.is_cancelled() {
                trace!(subject = %subject, "delivery after teardown, dropped");
                return;
            }
            counters.received.fetch_add(1, Ordering::Relaxed);

            let message = match delivery {
                Ok(message) => message,
                Err(e) => {
                    counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(subject = %subject, error = %e, "transport error, message dropped");
                    return;
                }
            };

            let parsed = message
                .text()
                .map_err(ParseError::from)
                .and_then(|body| parser(body));
            match parsed {
                Ok(value) => {
                    counters.accepted.fetch_add(1, Ordering::Relaxed);
                    sink(value);
                }
                Err(e) => {
                    counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(subject = %subject, error = %e, "unparseable message dropped");
                }
            }
            drop(open);
        })
    }
}

impl<T> SubscriptionManager<T> {
    /// Tear down the live subscription, if any. Idempotent.
    ///
    /// Closes the delivery gate first and waits for an in-flight delivery to
    /// leave the sink. Unsubscribe failures are logged and swallowed.
    pub fn teardown(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        *lock(&active.gate) = false;
        match active.handle.unsubscribe() {
            Ok(()) => debug!(subject = %active.subject, "unsubscribed"),
            Err(e) => warn!(subject = %active.subject, error = %e, "unsubscribe failed, ignoring"),
        }
        if let Some(hook) = &self.on_teardown {
            hook();
        }
    }
}

impl<T> Drop for SubscriptionManager<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<T> fmt::Debug for SubscriptionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("subject", &self.subject)
            .field("connection", &self.active.as_ref().map(|a| a.connection_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilestion_bus::{BusConnector, ConnectOptions, MemoryBus};
    use tilestion_protocol::parse_scalar;

    async fn connect(bus: &MemoryBus) -> ActiveConnection {
        let options = ConnectOptions {
            url: "nats://localhost:4222".into(),
            name: "nats-client-test".into(),
            user: String::new(),
            pass: String::new(),
        };
        ActiveConnection::new(bus.connect(&options).await.unwrap())
    }

    fn scalar_manager(subject: &str) -> (SubscriptionManager<f64>, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let manager = SubscriptionManager::new(
            subject,
            Arc::new(parse_scalar),
            Arc::new(move |v: f64| sink_seen.lock().unwrap().push(v)),
        );
        (manager, seen)
    }

    #[tokio::test]
    async fn subscribes_and_delivers() {
        let bus = MemoryBus::new();
        let conn = connect(&bus).await;
        let (mut manager, seen) = scalar_manager("value");

        manager.sync(Some(&conn)).unwrap();
        assert!(manager.is_subscribed());
        assert_eq!(manager.connection_id(), Some(conn.id()));

        bus.publish("value", r#"{"value": 1.5}"#);
        bus.publish("value", r#"{"value": 2.5}"#);

        assert_eq!(*seen.lock().unwrap(), vec![1.5, 2.5]);
        assert_eq!(manager.stats().accepted, 2);
    }

    #[tokio::test]
    async fn sync_is_idempotent_for_same_connection() {
        let bus = MemoryBus::new();
        let conn = connect(&bus).await;
        let (mut manager, _) = scalar_manager("value");

        manager.sync(Some(&conn)).unwrap();
        manager.sync(Some(&conn)).unwrap();
        manager.sync(Some(&conn.clone())).unwrap();

        assert_eq!(bus.counters("value").subscribes, 1);
        assert_eq!(bus.active_subscriptions("value"), 1);
    }

    #[tokio::test]
    async fn subject_change_moves_subscription() {
        let bus = MemoryBus::new();
        let conn = connect(&bus).await;
        let (mut manager, seen) = scalar_manager("a");
        manager.sync(Some(&conn)).unwrap();

        manager.set_subject("b", Some(&conn)).unwrap();

        assert_eq!(bus.counters("a").subscribes, 1);
        assert_eq!(bus.counters("a").unsubscribes, 1);
        assert_eq!(bus.counters("b").subscribes, 1);
        assert_eq!(bus.counters("b").unsubscribes, 0);
        assert_eq!(bus.active_subscriptions("a"), 0);
        assert_eq!(bus.active_subscriptions("b"), 1);

        bus.publish("a", r#"{"value": 1}"#);
        bus.publish("b", r#"{"value": 2}"#);
        assert_eq!(*seen.lock().unwrap(), vec![2.0]);
    }

    #[tokio::test]
    async fn new_connection_resubscribes() {
        let bus = MemoryBus::new();
        let first = connect(&bus).await;
        let second = connect(&bus).await;
        let (mut manager, _) = scalar_manager("value");

        manager.sync(Some(&first)).unwrap();
        manager.sync(Some(&second)).unwrap();

        assert_eq!(manager.connection_id(), Some(second.id()));
        assert_eq!(bus.counters("value").subscribes, 2);
        assert_eq!(bus.counters("value").unsubscribes, 1);
        assert_eq!(bus.active_subscriptions("value"), 1);
    }

    #[tokio::test]
    async fn no_connection_tears_down() {
        let bus = MemoryBus::new().with_late_delivery();
        let conn = connect(&bus).await;
        let (mut manager, seen) = scalar_manager("value");
        manager.sync(Some(&conn)).unwrap();

        manager.sync(None).unwrap();

        assert!(!manager.is_subscribed());
        assert_eq!(bus.active_subscriptions("value"), 0);
        assert_eq!(bus.publish_to_retired("value", r#"{"value": 9}"#), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_none_without_subscription_is_noop() {
        let bus = MemoryBus::new();
        let (mut manager, _) = scalar_manager("value");

        manager.sync(None).unwrap();
        manager.teardown();

        assert_eq!(bus.counters("value").unsubscribes, 0);
    }

    #[tokio::test]
    async fn parse_error_dropped_and_counted() {
        let bus = MemoryBus::new();
        let conn = connect(&bus).await;
        let (mut manager, seen) = scalar_manager("value");
        manager.sync(Some(&conn)).unwrap();

        bus.publish("value", "not json");
        bus.publish("value", r#"{"other": 1}"#);
        bus.publish("value", vec![0xff_u8, 0xfe]);
        bus.publish("value", r#"{"value": 4}"#);

        assert_eq!(*seen.lock().unwrap(), vec![4.0]);
        let stats = manager.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.parse_errors, 3);
        assert_eq!(stats.accepted, 1);
        assert!(manager.is_subscribed());
    }

    #[tokio::test]
    async fn transport_error_dropped_and_counted() {
        let bus = MemoryBus::new();
        let conn = connect(&bus).await;
        let (mut manager, seen) = scalar_manager("value");
        manager.sync(Some(&conn)).unwrap();

        bus.publish_error("value", BusError::Network("slow consumer".into()));
        bus.publish("value", r#"{"value": 5}"#);

        assert_eq!(*seen.lock().unwrap(), vec![5.0]);
        assert_eq!(manager.stats().transport_errors, 1);
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_unsubscribed_and_retries() {
        let bus = MemoryBus::new();
        let conn = connect(&bus).await;
        let (mut manager, _) = scalar_manager("value");

        bus.fail_next_subscribe(BusError::Subscription("permissions violation".into()));
        let err = manager.sync(Some(&conn)).unwrap_err();
        assert_eq!(err.subject, "value");
        assert!(!manager.is_subscribed());
        assert_eq!(bus.active_subscriptions("value"), 0);

        manager.sync(Some(&conn)).unwrap();
        assert!(manager.is_subscribed());
        assert_eq!(bus.active_subscriptions("value"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_failure_is_swallowed() {
        let bus = MemoryBus::new().with_late_delivery();
        let conn = connect(&bus).await;
        let (mut manager, seen) = scalar_manager("value");
        manager.sync(Some(&conn)).unwrap();

        bus.fail_next_unsubscribe(BusError::Closed);
        manager.teardown();

        assert!(!manager.is_subscribed());
        bus.publish_to_retired("value", r#"{"value": 1}"#);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retired_connection_gates_delivery() {
        let bus = MemoryBus::new().with_late_delivery();
        let manager_conn = tilestion_connection::ConnectionManager::new(Arc::new(bus.clone()));
        manager_conn.login("nats://localhost:4222", "alice", "").await.unwrap();
        let conn = manager_conn.connection().unwrap();
        let (mut manager, seen) = scalar_manager("value");
        manager.sync(Some(&conn)).unwrap();

        manager_conn.logout().await;
        assert!(conn.is_retired());
        bus.publish_to_retired("value", r#"{"value": 1}"#);
        assert!(seen.lock().unwrap().is_empty());

        manager.sync(Some(&conn)).unwrap();
        assert!(!manager.is_subscribed());
    }

    #[tokio::test]
    async fn teardown_hook_runs_once_per_live_subscription() {
        let bus = MemoryBus::new();
        let first = connect(&bus).await;
        let second = connect(&bus).await;
        let torn_down = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&torn_down);
        let (manager, _) = scalar_manager("value");
        let mut manager = manager.on_teardown(move || {
            counted.fetch_add(1, Ordering::Relaxed);
        });

        manager.teardown();
        assert_eq!(torn_down.load(Ordering::Relaxed), 0);

        manager.sync(Some(&first)).unwrap();
        manager.sync(Some(&second)).unwrap();
        assert_eq!(torn_down.load(Ordering::Relaxed), 1);

        manager.sync(None).unwrap();
        manager.sync(None).unwrap();
        assert_eq!(torn_down.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = MemoryBus::new();
        let conn = connect(&bus).await;
        let (mut manager, _) = scalar_manager("value");
        manager.sync(Some(&conn)).unwrap();

        drop(manager);

        assert_eq!(bus.active_subscriptions("value"), 0);
        assert_eq!(bus.counters("value").unsubscribes, 1);
    }
}
