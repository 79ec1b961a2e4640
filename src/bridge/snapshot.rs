//! Hot multicast stream of full list snapshots.
//!
//! Every emission of the upstream publisher replaces the held snapshot and is
//! pushed, whole, to every attached consumer. Consumers attaching later get
//! the latest snapshot once, then follow new emissions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::RxResult;
use crate::reactive::{ObserverResult, Publisher, Subscription, SubscriptionBuilder};

use super::backpressure::BackpressurePolicy;
use super::stream::{BufferedStream, StreamShared};

/// One complete, immutable list state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Position in the stream, starting at 1.
    pub version: u64,
    /// When the stream received the emission.
    pub published_at: DateTime<Utc>,
    /// The full list.
    pub items: Arc<[T]>,
}

impl<T> Snapshot<T> {
    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true for an empty list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The items as a slice.
    #[must_use]
    pub fn items(&self) -> &[T] {
        &self.items
    }
}

/// A consumer of a [`SnapshotStream`]: a `Latest`-policy stream, so a slow
/// reader skips intermediate snapshots and always reads the freshest one.
pub type SnapshotConsumer<T> = BufferedStream<Snapshot<T>>;

struct Hub<T> {
    latest: Option<Snapshot<T>>,
    version: u64,
    consumers: Vec<Arc<StreamShared<Snapshot<T>>>>,
    closed: bool,
}

impl<T: Clone> Hub<T> {
    fn publish(&mut self, items: &[T]) {
        if self.closed {
            return;
        }
        self.version += 1;
        let snapshot = Snapshot {
            version: self.version,
            published_at: Utc::now(),
            items: Arc::from(items),
        };
        self.consumers.retain(|consumer| consumer.push(snapshot.clone()));
        self.latest = Some(snapshot);
    }
}

/// Hot multicast over a list-valued publisher.
pub struct SnapshotStream<T> {
    hub: Arc<Mutex<Hub<T>>>,
    subscription: Subscription,
}

impl<T: Clone + Send + Sync + 'static> SnapshotStream<T> {
    /// Subscribes to `publisher`. A hot publisher's current value becomes the
    /// first snapshot.
    pub fn new(publisher: Arc<dyn Publisher<Vec<T>>>) -> RxResult<Self> {
        let hub = Arc::new(Mutex::new(Hub {
            latest: None,
            version: 0,
            consumers: Vec::new(),
            closed: false,
        }));
        let weak: Weak<Mutex<Hub<T>>> = Arc::downgrade(&hub);
        let subscription = SubscriptionBuilder::new(publisher).build_fn(move |items: &Vec<T>| -> ObserverResult {
            if let Some(hub) = weak.upgrade() {
                lock(&hub).publish(items);
            }
            Ok(())
        })?;
        Ok(Self { hub, subscription })
    }

    /// Attaches a consumer that first reads the latest snapshot, if any.
    ///
    /// The replay is queued under the same lock that orders emissions, so a
    /// consumer gets exactly one replay and never an older snapshot after a
    /// newer one.
    pub fn attach(&self) -> SnapshotConsumer<T> {
        self.attach_with(true)
    }

    /// Attaches a consumer that only sees emissions after this call.
    pub fn attach_changes_only(&self) -> SnapshotConsumer<T> {
        self.attach_with(false)
    }

    fn attach_with(&self, replay: bool) -> SnapshotConsumer<T> {
        let shared = StreamShared::new(BackpressurePolicy::Latest);
        let mut hub = lock(&self.hub);
        if hub.closed {
            shared.close();
        } else {
            if replay {
                if let Some(latest) = &hub.latest {
                    shared.push(latest.clone());
                }
            }
            hub.consumers.push(Arc::clone(&shared));
        }
        drop(hub);
        BufferedStream::new(shared, None)
    }

    /// The most recent snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<Snapshot<T>> {
        lock(&self.hub).latest.clone()
    }

    /// Number of emissions received.
    #[must_use]
    pub fn version(&self) -> u64 {
        lock(&self.hub).version
    }

    /// Number of open consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        let mut hub = lock(&self.hub);
        hub.consumers.retain(|consumer| consumer.is_open());
        hub.consumers.len()
    }
}

impl<T> SnapshotStream<T> {
    /// Unsubscribes and closes every consumer. Idempotent.
    pub fn close(&self) {
        let consumers = {
            let mut hub = lock(&self.hub);
            if hub.closed {
                return;
            }
            hub.closed = true;
            std::mem::take(&mut hub.consumers)
        };
        self.subscription.cancel();
        for consumer in consumers {
            consumer.close();
        }
        debug!("snapshot stream closed");
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.hub).closed
    }
}

impl<T> Drop for SnapshotStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for SnapshotStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hub = lock(&self.hub);
        f.debug_struct("SnapshotStream")
            .field("version", &hub.version)
            .field("consumers", &hub.consumers.len())
            .field("closed", &hub.closed)
            .finish_non_exhaustive()
    }
}

fn lock<T>(hub: &Mutex<Hub<T>>) -> MutexGuard<'_, Hub<T>> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}
