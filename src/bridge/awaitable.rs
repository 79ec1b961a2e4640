//! Single-shot future over one executor submission.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::RxResult;
use crate::executor::work::disconnected;
use crate::executor::WorkHandle;

/// Resolves to the result of one submitted work item.
///
/// Dropping an unresolved `Awaitable` (for example because the surrounding
/// task was cancelled or a `select!` branch lost) detaches it from the
/// result. The work keeps running to completion.
#[must_use = "an Awaitable does nothing unless awaited; dropping it detaches the waiter"]
#[derive(Debug)]
pub struct Awaitable<V> {
    handle: WorkHandle,
    rx: oneshot::Receiver<RxResult<V>>,
    resolved: bool,
}

impl<V> Awaitable<V> {
    pub(crate) fn new(handle: WorkHandle, rx: oneshot::Receiver<RxResult<V>>) -> Self {
        Self {
            handle,
            rx,
            resolved: false,
        }
    }

    /// The underlying work handle.
    #[must_use]
    pub const fn handle(&self) -> &WorkHandle {
        &self.handle
    }
}

impl<V> Future for Awaitable<V> {
    type Output = RxResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let received = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(received) => received,
        };
        self.resolved = true;
        Poll::Ready(received.unwrap_or_else(|_| Err(disconnected())))
    }
}

impl<V> Drop for Awaitable<V> {
    fn drop(&mut self) {
        if !self.resolved {
            self.handle.cancel();
        }
    }
}
