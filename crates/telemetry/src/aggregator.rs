//! Channel registry and query API.
//!
//! The aggregator keeps one [`WindowedBuffer`] and one [`SubscriptionManager`]
//! per channel id, both created on first reference. A channel is subscribed
//! only while someone holds interest in it ([`ChannelInterest`] or
//! [`Observation`]) and a connection is bound. Connection changes re-bind
//! every channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tilestion_connection::{ActiveConnection, ConnectionManager};
use tilestion_protocol::ParseError;
use tilestion_protocol::channels::DEFAULT_CAPACITY;

use crate::buffer::{TimestampedValue, WindowedBuffer};
use crate::coalescer::{DEFAULT_TICK, ObserverId, UpdateCoalescer, WeakCoalescer};
use crate::error::SubscriptionError;
use crate::subscription::{ChannelStats, Parser, Sink, SubscriptionManager};

/// Aggregator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Points retained per channel. Must be at least 1.
    pub capacity: usize,
    /// Coalescing interval for observer notifications.
    pub tick: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            tick: DEFAULT_TICK,
        }
    }
}

/// A channel id together with the bus subject it reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub id: String,
    pub subject: String,
}

impl ChannelSpec {
    /// Channel whose subject is its own id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            subject: id.clone(),
            id,
        }
    }

    pub fn with_subject(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
        }
    }
}

struct Binding<T> {
    interest: usize,
    subscription: SubscriptionManager<T>,
}

struct Channel<T> {
    id: String,
    buffer: Arc<Mutex<WindowedBuffer<T>>>,
    binding: Mutex<Binding<T>>,
}

struct Shared<T> {
    capacity: usize,
    parser: Parser<T>,
    coalescer: UpdateCoalescer<T>,
    channels: RwLock<HashMap<String, Arc<Channel<T>>>>,
    connection: Mutex<Option<ActiveConnection>>,
    closed: AtomicBool,
}

struct Watcher {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-channel telemetry store fed by bus subscriptions.
pub struct TelemetryAggregator<T> {
    shared: Arc<Shared<T>>,
    runtime: Handle,
    watcher: Mutex<Option<Watcher>>,
}

/// Keeps a channel subscribed while alive.
///
/// Interest is reference counted: the subscription is created when the first
/// interest appears and torn down when the last one is dropped.
pub struct ChannelInterest<T> {
    channel: Arc<Channel<T>>,
}

/// A registered observer plus the interest that keeps its channel fed.
/// Dropping it unregisters the observer.
pub struct Observation<T> {
    observer: ObserverId,
    coalescer: WeakCoalescer<T>,
    interest: ChannelInterest<T>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> Binding<T> {
    fn rebind(&mut self, channel: &str, connection: Option<&ActiveConnection>) {
        let target = if self.interest > 0 { connection } else { None };
        if let Err(e) = self.subscription.sync(target) {
            warn!(channel, error = %e, "channel left unsubscribed until the next reconfiguration");
        }
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn channel(&self, id: &str) -> Option<Arc<Channel<T>>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn channel_or_create(&self, id: &str) -> Arc<Channel<T>> {
        if let Some(channel) = self.channel(id) {
            return channel;
        }
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            channels
                .entry(id.to_owned())
                .or_insert_with(|| self.create(id, id)),
        )
    }

    fn create(&self, id: &str, subject: &str) -> Arc<Channel<T>> {
        debug!(channel = id, subject, "creating channel");
        let buffer = Arc::new(Mutex::new(WindowedBuffer::new(self.capacity)));
        let notifier = self.coalescer.notifier(id);
        let pending = notifier.clone();
        let sink_buffer = Arc::clone(&buffer);
        let sink: Sink<T> = Arc::new(move |value: T| {
            lock(&sink_buffer).push(value.clone());
            notifier.notify(value);
        });
        // A value pushed before teardown is kept but never announced.
        let subscription = SubscriptionManager::new(subject, Arc::clone(&self.parser), sink)
            .on_teardown(move || pending.discard());
        Arc::new(Channel {
            id: id.to_owned(),
            buffer,
            binding: Mutex::new(Binding {
                interest: 0,
                subscription,
            }),
        })
    }

    fn all_channels(&self) -> Vec<Arc<Channel<T>>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn sync_connection(&self, connection: Option<ActiveConnection>) {
        let mut current = lock(&self.connection);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        *current = connection.filter(|c| !c.is_retired());
        match current.as_ref() {
            Some(c) => info!(connection = c.id(), "binding channels to connection"),
            None => info!("no connection, tearing down channel subscriptions"),
        }
        for channel in self.all_channels() {
            lock(&channel.binding).rebind(&channel.id, current.as_ref());
        }
    }
}

impl<T> Shared<T> {
    fn close(&self) {
        {
            let mut current = lock(&self.connection);
            self.closed.store(true, Ordering::Release);
            *current = None;
            let channels: Vec<Arc<Channel<T>>> = self
                .channels
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            for channel in channels {
                lock(&channel.binding).subscription.teardown();
            }
        }
        self.coalescer.shutdown();
    }
}

impl<T: Clone + Send + 'static> TelemetryAggregator<T> {
    /// Create an aggregator decoding every channel with `parser`.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is zero or when called outside a tokio
    /// runtime.
    pub fn new<P>(config: AggregatorConfig, parser: P) -> Self
    where
        P: Fn(&str) -> Result<T, ParseError> + Send + Sync + 'static,
    {
        assert!(config.capacity > 0, "channel capacity must be > 0");
        let runtime = Handle::current();
        Self {
            shared: Arc::new(Shared {
                capacity: config.capacity,
                parser: Arc::new(parser),
                coalescer: UpdateCoalescer::with_handle(config.tick, runtime.clone()),
                channels: RwLock::new(HashMap::new()),
                connection: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            runtime,
            watcher: Mutex::new(None),
        }
    }

    /// Declare a channel with an explicit subject.
    ///
    /// Changing the subject of an existing channel moves its subscription.
    pub fn register(&self, spec: ChannelSpec) -> Result<(), SubscriptionError> {
        let channel = {
            let mut channels = self
                .shared
                .channels
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match channels.get(&spec.id) {
                Some(channel) => Arc::clone(channel),
                None => {
                    let channel = self.shared.create(&spec.id, &spec.subject);
                    channels.insert(spec.id, channel);
                    return Ok(());
                }
            }
        };

        let connection = lock(&self.shared.connection);
        let mut binding = lock(&channel.binding);
        if binding.subscription.subject() == spec.subject {
            return Ok(());
        }
        info!(channel = %spec.id, subject = %spec.subject, "channel subject changed");
        let target = if binding.interest > 0 {
            connection.as_ref()
        } else {
            None
        };
        binding.subscription.set_subject(spec.subject, target)
    }

    /// Register interest in `id`, subscribing it if a connection is bound.
    pub fn track(&self, id: &str) -> ChannelInterest<T> {
        let channel = self.shared.channel_or_create(id);
        {
            let connection = lock(&self.shared.connection);
            let mut binding = lock(&channel.binding);
            binding.interest += 1;
            if binding.interest == 1 {
                binding.rebind(&channel.id, connection.as_ref());
            }
        }
        ChannelInterest { channel }
    }

    /// Call `observer` with the newest value of `id` once per coalescing tick.
    ///
    /// The observer runs on a runtime task and must not call back into this
    /// aggregator's channel configuration (`track`, `register`, `stats`, ...)
    /// for its own channel: teardown of that channel waits for it to return.
    pub fn observe<F>(&self, id: &str, observer: F) -> Observation<T>
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        let interest = self.track(id);
        let observer = self.shared.coalescer.observe(id, observer);
        Observation {
            observer,
            coalescer: self.shared.coalescer.downgrade(),
            interest,
        }
    }

    /// Newest value of `id`, or `None` if the channel is unknown or empty.
    pub fn latest(&self, id: &str) -> Option<T> {
        let channel = self.shared.channel(id)?;
        let buffer = lock(&channel.buffer);
        buffer.latest().map(|p| p.value().clone())
    }

    pub fn latest_point(&self, id: &str) -> Option<TimestampedValue<T>> {
        let channel = self.shared.channel(id)?;
        let buffer = lock(&channel.buffer);
        buffer.latest().cloned()
    }

    /// Values of `id`, oldest first. Empty if the channel is unknown.
    pub fn series(&self, id: &str) -> Vec<T> {
        self.shared
            .channel(id)
            .map(|c| lock(&c.buffer).values())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, id: &str) -> Vec<TimestampedValue<T>> {
        self.shared
            .channel(id)
            .map(|c| lock(&c.buffer).snapshot())
            .unwrap_or_default()
    }

    /// Known channel ids, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn subject(&self, id: &str) -> Option<String> {
        let channel = self.shared.channel(id)?;
        let binding = lock(&channel.binding);
        Some(binding.subscription.subject().to_owned())
    }

    pub fn stats(&self, id: &str) -> Option<ChannelStats> {
        let channel = self.shared.channel(id)?;
        let binding = lock(&channel.binding);
        Some(binding.subscription.stats())
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.shared
            .channel(id)
            .is_some_and(|c| lock(&c.binding).subscription.is_subscribed())
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Connection the channels are currently bound to.
    pub fn connection(&self) -> Option<ActiveConnection> {
        lock(&self.shared.connection).clone()
    }

    /// Re-bind every channel to `connection`. `None` tears every
    /// subscription down.
    pub fn sync_connection(&self, connection: Option<ActiveConnection>) {
        self.shared.sync_connection(connection);
    }

    /// Follow `manager`'s connection: bind now, then re-bind on every change.
    ///
    /// Replaces a previously attached manager.
    pub fn attach(&self, manager: &ConnectionManager) {
        let mut rx = manager.watch_connection();
        let initial = rx.borrow_and_update().clone();
        self.shared.sync_connection(initial);

        let shared = Arc::downgrade(&self.shared);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("connection manager dropped, stopping watcher");
                            break;
                        }
                        let connection = rx.borrow_and_update().clone();
                        let Some(shared) = Weak::upgrade(&shared) else {
                            break;
                        };
                        shared.sync_connection(connection);
                    }
                }
            }
        });

        if let Some(old) = lock(&self.watcher).replace(Watcher { cancel, task }) {
            old.cancel.cancel();
        }
    }
}

impl<T> TelemetryAggregator<T> {
    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop following the connection, tear down every subscription and
    /// cancel pending notifications. Buffered data stays queryable.
    ///
    /// Once this returns no buffer push or observer call happens.
    pub fn shutdown(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.cancel.cancel();
            watcher.task.abort();
        }
        self.shared.close();
    }
}

impl<T> Drop for TelemetryAggregator<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T> fmt::Debug for TelemetryAggregator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryAggregator")
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl<T> ChannelInterest<T> {
    pub fn channel_id(&self) -> &str {
        &self.channel.id
    }
}

impl<T> Drop for ChannelInterest<T> {
    fn drop(&mut self) {
        let mut binding = lock(&self.channel.binding);
        binding.interest = binding.interest.saturating_sub(1);
        if binding.interest == 0 {
            binding.subscription.teardown();
        }
    }
}

impl<T> Observation<T> {
    pub fn channel_id(&self) -> &str {
        self.interest.channel_id()
    }
}

impl<T> Drop for Observation<T> {
    fn drop(&mut self) {
        self.coalescer.unobserve(self.observer);
    }
}
