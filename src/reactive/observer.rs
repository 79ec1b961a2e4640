//! Observer traits, identifiers and observer-side errors.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one registry entry.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(Uuid);

impl ObserverId {
    /// Create a new random observer id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an observer-side failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverErrorKind {
    /// A transformer returned an error.
    Transform,
    /// The observer callback returned an error.
    Observer,
    /// A transformer or observer panicked.
    Panicked,
}

/// Failure raised by a transformer or an observer callback.
///
/// These never escape `publish()`; they are routed to the subscription's
/// error handler or to the publisher's error channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} failed: {message}")]
pub struct ObserverError {
    /// Failure origin.
    pub kind: ObserverErrorKind,
    /// Human readable description.
    pub message: String,
}

impl ObserverError {
    /// A transformer failure.
    #[must_use]
    pub fn transform(message: impl Into<String>) -> Self {
        Self {
            kind: ObserverErrorKind::Transform,
            message: message.into(),
        }
    }

    /// An observer callback failure.
    #[must_use]
    pub fn observer(message: impl Into<String>) -> Self {
        Self {
            kind: ObserverErrorKind::Observer,
            message: message.into(),
        }
    }

    /// A caught panic.
    #[must_use]
    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: ObserverErrorKind::Panicked,
            message: message.into(),
        }
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::panicked(panic_message(payload))
    }
}

/// Result of one observer or transformer invocation.
pub type ObserverResult = Result<(), ObserverError>;

/// Receives data pushed by a [`Publisher`](super::Publisher).
///
/// Implementations run on arbitrary threads, possibly concurrently with
/// deliveries to other observers.
pub trait DataObserver<T>: Send + Sync {
    /// Called once per delivered value.
    fn on_data(&self, data: &T) -> ObserverResult;
}

impl<T, F> DataObserver<T> for F
where
    F: Fn(&T) -> ObserverResult + Send + Sync,
{
    fn on_data(&self, data: &T) -> ObserverResult {
        self(data)
    }
}

/// Receives transformer and observer failures for a subscription or publisher.
pub trait ErrorObserver: Send + Sync {
    /// Called once per failure.
    fn on_error(&self, error: &ObserverError);
}

impl<F> ErrorObserver for F
where
    F: Fn(&ObserverError) + Send + Sync,
{
    fn on_error(&self, error: &ObserverError) {
        self(error);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
