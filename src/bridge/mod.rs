//! Consumer-facing adapters over subscriptions and executor submissions.
//!
//! - [`as_stream`] turns a configured subscription into a blocking,
//!   cancelable [`BufferedStream`] with a [`BackpressurePolicy`]
//! - [`as_awaitable`] turns one executor submission into a future
//! - [`as_multicast_snapshot`] turns a list-valued publisher into a hot
//!   [`SnapshotStream`] that always hands out complete lists
//!
//! ```rust,ignore
//! let stream = bridge::as_stream(
//!     bridge::subscribe(cell.publisher()).only_changes(),
//!     BackpressurePolicy::DropOldest(64),
//! )?;
//! for value in stream {
//!     render(&value);
//! }
//! ```

/// Single-shot futures.
pub mod awaitable;
/// Backpressure policies.
pub mod backpressure;
/// Hot multicast snapshots.
pub mod snapshot;
/// Buffered streams.
pub mod stream;

use std::sync::Arc;

pub use awaitable::Awaitable;
pub use backpressure::BackpressurePolicy;
pub use snapshot::{Snapshot, SnapshotConsumer, SnapshotStream};
pub use stream::BufferedStream;

use crate::error::{RxResult, StreamError};
use crate::executor::Pending;
use crate::reactive::{ObserverError, ObserverResult, Publisher, Subscription, SubscriptionBuilder};

use stream::StreamShared;

/// Starts configuring a subscription to `publisher`.
#[must_use]
pub fn subscribe<T: Send + Sync + 'static>(publisher: Arc<dyn Publisher<T>>) -> SubscriptionBuilder<T> {
    SubscriptionBuilder::new(publisher)
}

/// Builds the subscription and feeds its deliveries into a stream.
///
/// Transformer and observer failures end the stream with
/// `StreamError::Upstream`. When the subscription is cancelled from
/// elsewhere (deliver-once, a [`SubscriptionList`](crate::SubscriptionList),
/// a reclaimed weak observer, a cancel handle) the stream ends gracefully
/// after its buffered items. Under [`BackpressurePolicy::Block`] a full buffer
/// blocks the publishing thread, so the stream must be read from elsewhere.
pub fn as_stream<T, U>(builder: SubscriptionBuilder<T, U>, policy: BackpressurePolicy) -> RxResult<BufferedStream<U>>
where
    T: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    let shared = StreamShared::new_checked(policy)?;
    let producer = Arc::downgrade(&shared);
    let subscription = attach_failure(builder, &shared).build_fn(move |value: &U| -> ObserverResult {
        if let Some(shared) = producer.upgrade() {
            shared.push(value.clone());
        }
        Ok(())
    })?;
    finish_on_cancel(&subscription, &shared);
    Ok(BufferedStream::new(shared, Some(subscription)))
}

/// Like [`as_stream`], but emits each element of every delivered list as its
/// own item, in list order.
pub fn as_item_stream<T, I>(
    builder: SubscriptionBuilder<T, Vec<I>>,
    policy: BackpressurePolicy,
) -> RxResult<BufferedStream<I>>
where
    T: Send + Sync + 'static,
    I: Clone + Send + Sync + 'static,
{
    let shared = StreamShared::new_checked(policy)?;
    let producer = Arc::downgrade(&shared);
    let subscription = attach_failure(builder, &shared).build_fn(move |items: &Vec<I>| -> ObserverResult {
        if let Some(shared) = producer.upgrade() {
            for item in items {
                if !shared.push(item.clone()) {
                    break;
                }
            }
        }
        Ok(())
    })?;
    finish_on_cancel(&subscription, &shared);
    Ok(BufferedStream::new(shared, Some(subscription)))
}

/// Wraps a pending submission in a future.
pub fn as_awaitable<V: Send + 'static>(pending: Pending<V>) -> Awaitable<V> {
    pending.into_awaitable()
}

/// Builds a hot snapshot stream over a list-valued publisher.
pub fn as_multicast_snapshot<T>(publisher: Arc<dyn Publisher<Vec<T>>>) -> RxResult<SnapshotStream<T>>
where
    T: Clone + Send + Sync + 'static,
{
    SnapshotStream::new(publisher)
}

/// Ends the stream once its subscription is cancelled, or right away if a
/// deliver-once replay already cancelled it during the build.
fn finish_on_cancel<S: Send + 'static>(subscription: &Subscription, shared: &Arc<StreamShared<S>>) {
    let target = Arc::downgrade(shared);
    subscription.on_cancel(move || {
        if let Some(shared) = target.upgrade() {
            shared.finish();
        }
    });
}

fn attach_failure<T, U, S>(builder: SubscriptionBuilder<T, U>, shared: &Arc<StreamShared<S>>) -> SubscriptionBuilder<T, U>
where
    T: Send + Sync + 'static,
    U: Send + Sync + 'static,
    S: Send + 'static,
{
    let target = Arc::downgrade(shared);
    builder.tap_errors(Arc::new(move |error: &ObserverError| {
        if let Some(shared) = target.upgrade() {
            shared.fail(
                StreamError::Upstream {
                    message: error.to_string(),
                }
                .into(),
            );
        }
    }))
}
