//! Publishers: the push side of the reactive subsystem.
//!
//! [`Publisher`] is the narrow interface the (external) storage layer drives
//! whenever committed data changes. [`ValuePublisher`] is the in-process
//! implementation: it keeps observers in a [`WeakObserverRegistry`] and
//! delivers on the thread that triggered the change.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

use super::observer::{DataObserver, ErrorObserver, ObserverError, ObserverId};
use super::registry::WeakObserverRegistry;

/// Push source of change events.
///
/// Observers are passed as [`Weak`] references: a publisher never keeps a
/// subscriber alive. Implementations must isolate observer failures; nothing
/// an observer does may escape [`publish`](Self::publish).
pub trait Publisher<T>: Send + Sync {
    /// Registers an observer for future publishes.
    fn subscribe(&self, observer: Weak<dyn DataObserver<T>>) -> ObserverId;

    /// Removes an observer. Unknown ids are ignored.
    fn unsubscribe(&self, id: ObserverId);

    /// Delivers `value` to every live observer.
    fn publish(&self, value: T);

    /// Delivers the current value to a single observer, if the publisher is
    /// hot and holds one.
    fn publish_single(&self, _observer: Weak<dyn DataObserver<T>>) {}

    /// Registers an observer and replays the current value to it first.
    ///
    /// The provided body is `subscribe` followed by `publish_single`, so a
    /// publish racing between the two reaches the observer twice. Publishers
    /// that can order both steps against concurrent publishes override it.
    fn subscribe_replaying(&self, observer: Weak<dyn DataObserver<T>>) -> ObserverId {
        let id = self.subscribe(observer.clone());
        self.publish_single(observer);
        id
    }

    /// Returns true if the publisher retains its latest value for replay.
    fn is_hot(&self) -> bool {
        false
    }
}

enum Request<T> {
    All(Arc<T>),
    Single(Weak<dyn DataObserver<T>>),
    Replay(Weak<dyn DataObserver<T>>, Arc<T>),
}

enum Pass<T> {
    All(Arc<T>, Vec<(ObserverId, Arc<dyn DataObserver<T>>)>),
    One(Weak<dyn DataObserver<T>>, Option<Arc<T>>),
}

struct DrainQueue<T> {
    pending: VecDeque<Request<T>>,
    draining: bool,
}

/// In-process publisher with optional replay of the latest value.
///
/// Publishing enqueues a request. The first thread that finds the queue idle
/// becomes the drainer and delivers queued requests in FIFO order until the
/// queue is empty; concurrent or re-entrant publishes only enqueue. Every
/// observer therefore sees values in publish order, and an observer may call
/// `publish` from inside its callback without deadlocking (the nested value is
/// delivered after the current pass).
pub struct ValuePublisher<T> {
    registry: WeakObserverRegistry<T>,
    hot: bool,
    current: Mutex<Option<Arc<T>>>,
    version: AtomicU64,
    failures: AtomicU64,
    queue: Mutex<DrainQueue<T>>,
    error_observer: Option<Arc<dyn ErrorObserver>>,
}

impl<T: Send + Sync + 'static> ValuePublisher<T> {
    /// Creates a hot publisher: it remembers the latest value and replays it
    /// to new subscribers that ask for it.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mode(true)
    }

    /// Creates a cold publisher: no value is retained and nothing is replayed.
    #[must_use]
    pub fn cold() -> Self {
        Self::with_mode(false)
    }

    /// Creates a hot publisher seeded with an initial value.
    #[must_use]
    pub fn with_initial(value: T) -> Self {
        let publisher = Self::new();
        *publisher.current_slot() = Some(Arc::new(value));
        publisher
    }

    fn with_mode(hot: bool) -> Self {
        Self {
            registry: WeakObserverRegistry::new(),
            hot,
            current: Mutex::new(None),
            version: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            queue: Mutex::new(DrainQueue {
                pending: VecDeque::new(),
                draining: false,
            }),
            error_observer: None,
        }
    }

    /// Installs the publisher-level error channel.
    ///
    /// It receives observer failures that no subscription-level error handler
    /// claimed.
    #[must_use]
    pub fn with_error_observer(mut self, observer: impl ErrorObserver + 'static) -> Self {
        self.error_observer = Some(Arc::new(observer));
        self
    }

    /// The latest published value (hot publishers only).
    #[must_use]
    pub fn current(&self) -> Option<Arc<T>> {
        self.current_slot().clone()
    }

    /// Number of publishes delivered so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of observer failures reported to the error channel.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Number of registered observers, after pruning dead entries.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.registry.prune();
        self.registry.len()
    }

    /// Queues `value` without delivering it. Delivery happens on the next
    /// [`flush`](Self::flush) or publish, whichever drains first, in queue
    /// order.
    pub(crate) fn publish_deferred(&self, value: T) {
        self.queue_slot().pending.push_back(Request::All(Arc::new(value)));
    }

    /// Delivers queued values unless another thread is already doing so.
    pub(crate) fn flush(&self) {
        {
            let mut queue = self.queue_slot();
            if queue.draining || queue.pending.is_empty() {
                return;
            }
            queue.draining = true;
        }
        self.drain();
    }

    fn enqueue(&self, request: Request<T>) {
        {
            let mut queue = self.queue_slot();
            queue.pending.push_back(request);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        self.drain();
    }

    fn drain(&self) {
        let _reset = DrainReset(&self.queue);
        loop {
            // The current value and the live set are taken under the queue
            // lock, so a replaying subscribe lands either fully before or
            // fully after each pass.
            let pass = {
                let mut queue = self.queue_slot();
                match queue.pending.pop_front() {
                    None => {
                        queue.draining = false;
                        return;
                    }
                    Some(Request::All(value)) => {
                        if self.hot {
                            *self.current_slot() = Some(Arc::clone(&value));
                        }
                        self.version.fetch_add(1, Ordering::AcqRel);
                        Pass::All(value, self.registry.live())
                    }
                    Some(Request::Single(observer)) => Pass::One(observer, None),
                    Some(Request::Replay(observer, value)) => Pass::One(observer, Some(value)),
                }
            };

            match pass {
                Pass::All(value, live) => {
                    for (id, observer) in &live {
                        self.deliver(*id, observer.as_ref(), &value);
                    }
                }
                Pass::One(observer, value) => {
                    let Some(observer) = observer.upgrade() else {
                        continue;
                    };
                    let Some(value) = value.or_else(|| self.current()) else {
                        continue;
                    };
                    self.deliver(ObserverId::new(), observer.as_ref(), &value);
                }
            }
        }
    }

    fn deliver(&self, id: ObserverId, observer: &dyn DataObserver<T>, value: &T) {
        let error = match catch_unwind(AssertUnwindSafe(|| observer.on_data(value))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => ObserverError::from_panic(payload.as_ref()),
        };
        self.report(id, &error);
    }

    fn report(&self, id: ObserverId, error: &ObserverError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        match &self.error_observer {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler.on_error(error))).is_err() {
                    warn!(observer = %id, "publisher error observer panicked");
                }
            }
            None => warn!(observer = %id, error = %error, "observer failed during publish"),
        }
    }

    fn current_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<T>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_slot(&self) -> std::sync::MutexGuard<'_, DrainQueue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + Sync + 'static> Default for ValuePublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Publisher<T> for ValuePublisher<T> {
    fn subscribe(&self, observer: Weak<dyn DataObserver<T>>) -> ObserverId {
        let id = self.registry.register_weak(observer);
        debug!(observer = %id, "observer subscribed");
        id
    }

    fn unsubscribe(&self, id: ObserverId) {
        if self.registry.unregister(id) {
            debug!(observer = %id, "observer unsubscribed");
        }
    }

    fn publish(&self, value: T) {
        self.enqueue(Request::All(Arc::new(value)));
    }

    fn publish_single(&self, observer: Weak<dyn DataObserver<T>>) {
        if self.hot {
            self.enqueue(Request::Single(observer));
        }
    }

    /// Registration and replay happen under the delivery queue lock. The
    /// replay goes ahead of queued publishes, carrying the value current at
    /// registration, so the observer sees every value once and in order.
    fn subscribe_replaying(&self, observer: Weak<dyn DataObserver<T>>) -> ObserverId {
        if !self.hot {
            return self.subscribe(observer);
        }
        let id = {
            let mut queue = self.queue_slot();
            let id = self.registry.register_weak(observer.clone());
            if let Some(value) = self.current() {
                queue.pending.push_front(Request::Replay(observer, value));
            }
            if queue.draining {
                return id;
            }
            queue.draining = true;
            id
        };
        debug!(observer = %id, "observer subscribed with replay");
        self.drain();
        id
    }

    fn is_hot(&self) -> bool {
        self.hot
    }
}

impl<T> std::fmt::Debug for ValuePublisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuePublisher")
            .field("hot", &self.hot)
            .field("observers", &self.registry.len())
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the draining flag if a drain pass unwinds, so the publisher is not
/// left permanently "busy".
struct DrainReset<'a, T>(&'a Mutex<DrainQueue<T>>);

impl<T> Drop for DrainReset<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).draining = false;
        }
    }
}
