//! Subscription handles and their cancellation state machine.
//!
//! A subscription moves `Created -> Active -> Cancelled` and never backwards.
//! Exactly one caller wins the transition to `Cancelled` and runs teardown,
//! no matter how many threads (or re-entrant callbacks) race to cancel.

use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::observer::{ObserverId, SubscriptionId};

const CREATED: u8 = 0;
const ACTIVE: u8 = 1;
const CANCELLED: u8 = 2;

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// Registered with the publisher but not yet armed.
    Created,
    /// Receiving deliveries.
    Active,
    /// Terminal.
    Cancelled,
}

/// Shared cancellation state, referenced by the handle and by the delivery
/// observer registered with the publisher.
pub(crate) struct SubscriptionState {
    id: SubscriptionId,
    status: AtomicU8,
    teardown: Mutex<Option<Hook>>,
    hooks: Mutex<Vec<Hook>>,
}

impl SubscriptionState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SubscriptionId::new(),
            status: AtomicU8::new(CREATED),
            teardown: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.status.load(Ordering::Acquire) == CANCELLED
    }

    fn status(&self) -> SubscriptionStatus {
        match self.status.load(Ordering::Acquire) {
            CREATED => SubscriptionStatus::Created,
            ACTIVE => SubscriptionStatus::Active,
            _ => SubscriptionStatus::Cancelled,
        }
    }

    /// Moves `Created -> Active` and stores the teardown action.
    ///
    /// If the subscription was cancelled while still `Created` (e.g. by a
    /// delivery racing registration), the teardown runs right here instead.
    pub(crate) fn arm(&self, teardown: Hook) {
        let mut slot = self.teardown.lock().unwrap_or_else(PoisonError::into_inner);
        match self
            .status
            .compare_exchange(CREATED, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => *slot = Some(teardown),
            Err(_) => {
                drop(slot);
                teardown();
            }
        }
    }

    /// Returns true if this call performed the cancellation.
    pub(crate) fn cancel(&self) -> bool {
        if self.status.swap(CANCELLED, Ordering::AcqRel) == CANCELLED {
            return false;
        }

        let teardown = self.teardown.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(teardown) = teardown {
            teardown();
        }

        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            hook();
        }

        debug!(subscription = %self.id, "subscription cancelled");
        true
    }

    fn on_cancel(&self, hook: Hook) {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.push(hook);
        }
    }
}

/// A live relationship between one observer and one publisher.
///
/// Dropping the handle cancels the subscription. Keep it for as long as
/// deliveries are wanted.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    state: Arc<SubscriptionState>,
    observer_id: ObserverId,
    // The publisher only holds a weak reference to the delivery observer.
    observer: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Subscription {
    pub(crate) fn new(
        state: Arc<SubscriptionState>,
        observer_id: ObserverId,
        observer: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            state,
            observer_id,
            observer: Mutex::new(Some(observer)),
        }
    }

    /// The subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.state.id
    }

    /// The publisher-side registry id of the delivery observer.
    #[must_use]
    pub const fn observer_id(&self) -> ObserverId {
        self.observer_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        self.state.status()
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Cancels the subscription.
    ///
    /// Idempotent and safe to call concurrently or from inside the observer
    /// callback. A callback already running on another thread finishes, but
    /// no delivery starts after this returns. Returns true if this call
    /// performed the teardown.
    pub fn cancel(&self) -> bool {
        let performed = self.state.cancel();
        let observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(observer);
        performed
    }

    /// Registers a hook that runs once when the subscription is cancelled,
    /// or immediately if it already is.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.on_cancel(Box::new(hook));
    }

    /// A cloneable handle that can cancel this subscription from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("observer_id", &self.observer_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Cancels a subscription without owning it.
///
/// Unlike [`Subscription`], dropping a `CancelHandle` does nothing.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<SubscriptionState>,
}

impl CancelHandle {
    /// Cancels the subscription; see [`Subscription::cancel`].
    pub fn cancel(&self) -> bool {
        self.state.cancel()
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// The subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.state.id
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("id", &self.state.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Default)]
struct ListState {
    entries: Vec<CancelHandle>,
    cancelled: bool,
}

/// Tracks several subscriptions so they can be cancelled together.
#[derive(Clone, Default)]
pub struct SubscriptionList {
    inner: Arc<Mutex<ListState>>,
}

impl SubscriptionList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a subscription. Clears a previous cancelled state.
    pub fn add(&self, subscription: &Subscription) {
        self.add_handle(subscription.cancel_handle());
    }

    /// Tracks a cancel handle. Clears a previous cancelled state.
    pub fn add_handle(&self, handle: CancelHandle) {
        let mut state = self.lock();
        state.entries.push(handle);
        state.cancelled = false;
    }

    /// Cancels every tracked subscription and forgets them.
    pub fn cancel(&self) {
        let entries = {
            let mut state = self.lock();
            state.cancelled = true;
            std::mem::take(&mut state.entries)
        };
        for entry in entries {
            entry.cancel();
        }
    }

    /// True if `cancel` ran and nothing was added since.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Number of tracked subscriptions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ListState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SubscriptionList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SubscriptionList")
            .field("active", &state.entries.len())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
