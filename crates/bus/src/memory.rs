//! In-process loopback broker.
//!
//! [`MemoryBus`] implements [`BusConnector`] entirely in memory. Publishing
//! delivers synchronously on the caller's thread to every matching
//! subscription. It keeps per-subject call counters and supports one-shot
//! failure injection so lifecycle behaviour can be observed from tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use tracing::{debug, trace};

use crate::client::{
    BusConnection, BusConnector, BusMessage, BusSubscription, ConnectOptions, MessageHandler,
};
use crate::error::BusError;

/// Subscribe/unsubscribe calls observed for one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubjectCounters {
    pub subscribes: u32,
    pub unsubscribes: u32,
}

struct Subscriber {
    connection: u64,
    subject: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct BrokerState {
    /// Accepted `user -> password` pairs. Empty means anonymous access.
    users: HashMap<String, String>,
    next_id: u64,
    /// Open connections by id, with their client names.
    connections: HashMap<u64, String>,
    subscriptions: HashMap<u64, Subscriber>,
    /// Keep handlers of removed subscriptions for [`MemoryBus::publish_to_retired`].
    late_delivery: bool,
    /// Handlers of subscriptions removed while `late_delivery` was on.
    retired: Vec<(String, MessageHandler)>,
    counters: HashMap<String, SubjectCounters>,
    connect_delay: Option<Duration>,
    next_connect_error: Option<BusError>,
    next_subscribe_error: Option<BusError>,
    next_unsubscribe_error: Option<BusError>,
    stall_drain: bool,
}

/// In-process publish/subscribe broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBus {
    /// Creates a broker that accepts any credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires clients to authenticate as `user` / `pass` (or any other
    /// added user).
    pub fn with_user(self, user: &str, pass: &str) -> Self {
        self.add_user(user, pass);
        self
    }

    pub fn add_user(&self, user: &str, pass: &str) {
        self.state().users.insert(user.to_owned(), pass.to_owned());
    }

    /// Delays every connect attempt by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    /// Makes the next connect attempt fail with `err`.
    pub fn fail_next_connect(&self, err: BusError) {
        self.state().next_connect_error = Some(err);
    }

    /// Makes the next subscribe call fail with `err`.
    pub fn fail_next_subscribe(&self, err: BusError) {
        self.state().next_subscribe_error = Some(err);
    }

    /// Makes the next unsubscribe call report `err`. The subscription is
    /// still removed.
    pub fn fail_next_unsubscribe(&self, err: BusError) {
        self.state().next_unsubscribe_error = Some(err);
    }

    /// Keeps the handlers of removed subscriptions so late deliveries can be
    /// replayed with [`publish_to_retired`](Self::publish_to_retired).
    pub fn with_late_delivery(self) -> Self {
        self.set_late_delivery(true);
        self
    }

    /// Turning late delivery off releases every kept handler.
    pub fn set_late_delivery(&self, enabled: bool) {
        let released = {
            let mut state = self.state();
            state.late_delivery = enabled;
            if enabled {
                Vec::new()
            } else {
                std::mem::take(&mut state.retired)
            }
        };
        drop(released);
    }

    /// When set, `drain` never completes.
    pub fn set_stall_drain(&self, stall: bool) {
        self.state().stall_drain = stall;
    }

    /// Publishes `payload` on `subject`. Returns the number of deliveries.
    pub fn publish(&self, subject: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let handlers = self.matching_handlers(subject);
        for handler in &handlers {
            handler(Ok(BusMessage::new(subject, payload.clone())));
        }
        trace!(subject, deliveries = handlers.len(), "published");
        handlers.len()
    }

    /// Delivers a transport error to every subscription matching `subject`.
    pub fn publish_error(&self, subject: &str, err: BusError) -> usize {
        let handlers = self.matching_handlers(subject);
        for handler in &handlers {
            handler(Err(err.clone()));
        }
        handlers.len()
    }

    /// Delivers `payload` to handlers whose subscriptions were already removed,
    /// imitating a late delivery racing an unsubscribe.
    ///
    /// Only subscriptions removed while late delivery was enabled are reached.
    pub fn publish_to_retired(&self, subject: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let handlers: Vec<MessageHandler> = self
            .state()
            .retired
            .iter()
            .filter(|(pattern, _)| subject_matches(pattern, subject))
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in &handlers {
            handler(Ok(BusMessage::new(subject, payload.clone())));
        }
        handlers.len()
    }

    /// Subscribe/unsubscribe calls made for exactly `subject`.
    pub fn counters(&self, subject: &str) -> SubjectCounters {
        self.state()
            .counters
            .get(subject)
            .copied()
            .unwrap_or_default()
    }

    /// Live subscriptions registered for exactly `subject`.
    pub fn active_subscriptions(&self, subject: &str) -> usize {
        self.state()
            .subscriptions
            .values()
            .filter(|s| s.subject == subject)
            .count()
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Client names of open connections, sorted.
    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().connections.values().cloned().collect();
        names.sort_unstable();
        names
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matching_handlers(&self, subject: &str) -> Vec<MessageHandler> {
        self.state()
            .subscriptions
            .values()
            .filter(|s| subject_matches(&s.subject, subject))
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    fn retire_connection(&self, connection: u64) {
        let mut released = Vec::new();
        {
            let mut state = self.state();
            let ids: Vec<u64> = state
                .subscriptions
                .iter()
                .filter(|(_, s)| s.connection == connection)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(sub) = state.subscriptions.remove(&id) {
                    released.extend(state.retire(sub));
                }
            }
        }
        drop(released);
    }
}

impl BrokerState {
    /// Parks the handler of a removed subscription, or hands it back to be
    /// dropped once the state lock is released.
    fn retire(&mut self, sub: Subscriber) -> Option<MessageHandler> {
        if self.late_delivery {
            self.retired.push((sub.subject, sub.handler));
            None
        } else {
            Some(sub.handler)
        }
    }
}

impl BusConnector for MemoryBus {
    fn connect<'a>(
        &'a self,
        options: &'a ConnectOptions,
    ) -> BoxFuture<'a, Result<Arc<dyn BusConnection>, BusError>> {
        async move {
            let delay = self.state().connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.state();
            if let Some(err) = state.next_connect_error.take() {
                return Err(err);
            }
            if options.url.is_empty() {
                return Err(BusError::Network("no servers configured".into()));
            }
            if !state.users.is_empty() && state.users.get(&options.user) != Some(&options.pass) {
                return Err(BusError::Auth("authorization violation".into()));
            }

            state.next_id += 1;
            let id = state.next_id;
            state.connections.insert(id, options.name.clone());
            debug!(connection = id, name = %options.name, "memory bus client connected");

            let conn: Arc<dyn BusConnection> = Arc::new(MemoryConnection {
                id,
                bus: self.clone(),
                closed: AtomicBool::new(false),
            });
            Ok(conn)
        }
        .boxed()
    }
}

struct MemoryConnection {
    id: u64,
    bus: MemoryBus,
    closed: AtomicBool,
}

impl BusConnection for MemoryConnection {
    fn subscribe(
        &self,
        subject: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let mut state = self.bus.state();
        state
            .counters
            .entry(subject.to_owned())
            .or_default()
            .subscribes += 1;
        if let Some(err) = state.next_subscribe_error.take() {
            return Err(err);
        }

        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.insert(
            id,
            Subscriber {
                connection: self.id,
                subject: subject.to_owned(),
                handler,
            },
        );

        Ok(Box::new(MemorySubscription {
            id,
            subject: subject.to_owned(),
            bus: self.bus.clone(),
            active: true,
        }))
    }

    fn drain(&self) -> BoxFuture<'_, Result<(), BusError>> {
        async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BusError::Closed);
            }
            let stall = self.bus.state().stall_drain;
            if stall {
                future::pending::<()>().await;
            }
            self.bus.retire_connection(self.id);
            Ok(())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), BusError>> {
        async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.bus.retire_connection(self.id);
            self.bus.state().connections.remove(&self.id);
            debug!(connection = self.id, "memory bus client closed");
            Ok(())
        }
        .boxed()
    }
}

struct MemorySubscription {
    id: u64,
    subject: String,
    bus: MemoryBus,
    active: bool,
}

impl BusSubscription for MemorySubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn unsubscribe(&mut self) -> Result<(), BusError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        let mut state = self.bus.state();
        state
            .counters
            .entry(self.subject.clone())
            .or_default()
            .unsubscribes += 1;
        let released = state
            .subscriptions
            .remove(&self.id)
            .and_then(|sub| state.retire(sub));
        let result = match state.next_unsubscribe_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        drop(state);
        drop(released);
        result
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
    }
}

/// NATS-style subject matching: `*` matches one token, a trailing `>` matches
/// one or more tokens.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
