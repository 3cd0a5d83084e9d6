//! Per-channel update coalescing.
//!
//! Producers call [`Notifier::notify`] once per received value. The first
//! notify on an idle channel schedules a single delivery one tick later;
//! further notifies before that tick only replace the pending value. When
//! the tick fires, observers of the channel see the newest value exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Delay between the first update on a channel and its delivery (~60 Hz).
pub const DEFAULT_TICK: Duration = Duration::from_millis(16);

/// Callback invoked with `(channel, newest value)` once per tick.
pub type Observer<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

/// Handle returned by [`UpdateCoalescer::observe`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct PendingSlot<T> {
    value: Option<T>,
    scheduled: bool,
    // Thread currently running this channel's observers.
    delivering: Option<ThreadId>,
}

struct ChannelSlot<T> {
    pending: Mutex<PendingSlot<T>>,
    // Held while this channel's observers run.
    delivery: Mutex<()>,
}

type Slot<T> = Arc<ChannelSlot<T>>;

struct Inner<T> {
    tick: Duration,
    runtime: Handle,
    cancel: CancellationToken,
    slots: Mutex<HashMap<String, Slot<T>>>,
    observers: RwLock<HashMap<String, Vec<(ObserverId, Observer<T>)>>>,
    // Held shared by every delivery and exclusively by shutdown.
    delivery: RwLock<()>,
    next_observer: AtomicU64,
    delivered: AtomicU64,
}

/// Coalesces bursts of per-channel updates into one notification per tick.
///
/// Channels are independent: a burst on one never delays another. Values are
/// delivered from tasks spawned on the runtime captured at construction, so
/// [`Notifier::notify`] may be called from any thread.
pub struct UpdateCoalescer<T> {
    inner: Arc<Inner<T>>,
}

/// Cheap per-channel producer handle.
///
/// Resolves the channel slot once so the hot path never touches the shared
/// channel map.
pub struct Notifier<T> {
    channel: Arc<str>,
    slot: Slot<T>,
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            slot: Arc::clone(&self.slot),
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> UpdateCoalescer<T> {
    /// Create a coalescer bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(tick: Duration) -> Self {
        Self::with_handle(tick, Handle::current())
    }

    pub fn with_handle(tick: Duration, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                tick,
                runtime,
                cancel: CancellationToken::new(),
                slots: Mutex::new(HashMap::new()),
                observers: RwLock::new(HashMap::new()),
                delivery: RwLock::new(()),
                next_observer: AtomicU64::new(1),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    pub fn tick(&self) -> Duration {
        self.inner.tick
    }

    /// Producer handle for `channel`.
    pub fn notifier(&self, channel: &str) -> Notifier<T> {
        let slot = {
            let mut slots = lock(&self.inner.slots);
            Arc::clone(slots.entry(channel.to_owned()).or_insert_with(|| {
                Arc::new(ChannelSlot {
                    pending: Mutex::new(PendingSlot {
                        value: None,
                        scheduled: false,
                        delivering: None,
                    }),
                    delivery: Mutex::new(()),
                })
            }))
        };
        Notifier {
            channel: Arc::from(channel),
            slot,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Record a new value for `channel`. Convenience over [`notifier`](Self::notifier).
    pub fn notify(&self, channel: &str, value: T)
    where
        T: Send + 'static,
    {
        self.notifier(channel).notify(value);
    }

    /// Register `observer` for `channel`.
    pub fn observe<F>(&self, channel: &str, observer: F) -> ObserverId
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        let id = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.cancel.is_cancelled() {
            return id;
        }
        observers
            .entry(channel.to_owned())
            .or_default()
            .push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    ///
    /// A delivery already in progress may still reach the observer once.
    pub fn unobserve(&self, id: ObserverId) {
        self.inner.unobserve(id);
    }

    /// Weak handle for unregistering after the coalescer may be gone.
    pub(crate) fn downgrade(&self) -> WeakCoalescer<T> {
        WeakCoalescer(Arc::downgrade(&self.inner))
    }

    /// Number of observer notifications delivered so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel every scheduled tick and drop all observers.
    ///
    /// Waits for a delivery in progress to finish; once this returns no
    /// observer is called again. Must not be called from inside an observer.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        drop(
            self.inner
                .delivery
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for slot in lock(&self.inner.slots).values() {
            lock(&slot.pending).value = None;
        }
    }
}

impl<T> Drop for UpdateCoalescer<T> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl<T> Inner<T> {
    fn unobserve(&self, id: ObserverId) {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        for list in observers.values_mut() {
            list.retain(|(oid, _)| *oid != id);
        }
        observers.retain(|_, list| !list.is_empty());
    }

    fn deliver(&self, channel: &str, slot: &ChannelSlot<T>) {
        let _delivery = self.delivery.read().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return;
        }
        let _channel_delivery = lock(&slot.delivery);
        let value = {
            let mut pending = lock(&slot.pending);
            pending.scheduled = false;
            let value = pending.value.take();
            if value.is_some() {
                pending.delivering = Some(thread::current().id());
            }
            value
        };
        let Some(value) = value else {
            return;
        };
        let observers: Vec<Observer<T>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|list| list.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default();
        trace!(channel, observers = observers.len(), "delivering coalesced update");
        for observer in &observers {
            observer(channel, &value);
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        lock(&slot.pending).delivering = None;
    }
}

impl<T> Notifier<T> {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Drop the pending value, if any, so the scheduled tick delivers nothing.
    ///
    /// Waits for a delivery of this channel already running on another
    /// thread. Once this returns, observers of the channel only see values
    /// notified afterwards. Called from one of the channel's own observers it
    /// returns without waiting.
    pub fn discard(&self) {
        {
            let mut pending = lock(&self.slot.pending);
            pending.value = None;
            if pending.delivering == Some(thread::current().id()) {
                return;
            }
        }
        drop(lock(&self.slot.delivery));
    }
}

impl<T: Send + 'static> Notifier<T> {
    /// Store `value` as the pending update, scheduling a delivery if none is
    /// pending. Never blocks on observers.
    pub fn notify(&self, value: T) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        {
            let mut pending = lock(&self.slot.pending);
            pending.value = Some(value);
            if pending.scheduled {
                return;
            }
            pending.scheduled = true;
        }

        let inner = Arc::clone(&self.inner);
        let slot = Arc::clone(&self.slot);
        let channel = Arc::clone(&self.channel);
        self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.tick) => inner.deliver(&channel, &slot),
            }
        });
    }
}

pub(crate) struct WeakCoalescer<T>(std::sync::Weak<Inner<T>>);

impl<T> WeakCoalescer<T> {
    pub(crate) fn unobserve(&self, id: ObserverId) {
        if let Some(inner) = self.0.upgrade() {
            inner.unobserve(id);
        }
    }
}
