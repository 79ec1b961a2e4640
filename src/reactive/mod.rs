//! Reactive subsystem: publishers, weakly held observers and subscriptions.
//!
//! A [`Publisher`] pushes values to observers registered through a
//! [`WeakObserverRegistry`]. Application code does not register observers
//! directly; it configures a [`SubscriptionBuilder`] and keeps the returned
//! [`Subscription`] for as long as it wants deliveries.

/// Fluent subscription configuration.
pub mod builder;
/// Observer traits, ids and observer-side errors.
pub mod observer;
/// Publisher trait and in-process implementation.
pub mod publisher;
/// Weakly held observer entries.
pub mod registry;
/// Delivery marshaling onto caller-chosen contexts.
pub mod scheduler;
/// Subscription handles and lists.
pub mod subscription;

pub use builder::SubscriptionBuilder;
pub use observer::{DataObserver, ErrorObserver, ObserverError, ObserverErrorKind, ObserverId, ObserverResult, SubscriptionId};
pub use publisher::{Publisher, ValuePublisher};
pub use registry::WeakObserverRegistry;
pub use scheduler::{InlineScheduler, Scheduler, SchedulerConfig, Task, ThreadScheduler};
pub use subscription::{CancelHandle, Subscription, SubscriptionList, SubscriptionStatus};
