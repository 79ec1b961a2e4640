//! Work item completion and the handles given back to submitters.
//!
//! Cancelling a handle only detaches the waiter. The submitted work always
//! runs; its result is discarded if the waiter already went away.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{error, trace};

use crate::bridge::Awaitable;
use crate::error::{ExecutionError, RxError, RxResult};
use crate::reactive::observer::panic_message;

/// Completion callback of a work item.
pub type OnDone<V> = Box<dyn FnOnce(RxResult<V>) + Send + 'static>;

/// Exactly-once completion guard of one work item.
pub(crate) struct Completion<V> {
    completed: AtomicBool,
    cancelled: AtomicBool,
    on_done: Mutex<Option<OnDone<V>>>,
}

impl<V: Send + 'static> Completion<V> {
    pub(crate) fn new(on_done: OnDone<V>) -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            on_done: Mutex::new(Some(on_done)),
        })
    }

    /// Delivers `result` unless the item already completed. Returns true if
    /// this call won.
    pub(crate) fn complete(&self, result: RxResult<V>) -> bool {
        self.finish(result, false)
    }

    fn finish(&self, result: RxResult<V>, cancelling: bool) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            trace!(cancelling, "work item already completed; result dropped");
            return false;
        }
        if cancelling {
            self.cancelled.store(true, Ordering::Release);
        }

        let on_done = self.on_done.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(on_done) = on_done {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_done(result))) {
                error!(panic = %panic_message(payload.as_ref()), "completion callback panicked");
            }
        }
        true
    }
}

/// Type-erased control surface used by [`WorkHandle`].
trait CompletionControl: Send + Sync {
    fn cancel(&self) -> bool;
    fn is_completed(&self) -> bool;
    fn is_cancelled(&self) -> bool;
}

impl<V: Send + 'static> CompletionControl for Completion<V> {
    fn cancel(&self) -> bool {
        self.finish(Err(RxError::Execution(ExecutionError::Cancelled)), true)
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handle to a submitted work item.
#[derive(Clone)]
pub struct WorkHandle {
    control: Arc<dyn CompletionControl>,
}

impl WorkHandle {
    pub(crate) fn new<V: Send + 'static>(completion: Arc<Completion<V>>) -> Self {
        Self { control: completion }
    }

    /// Detaches the waiter.
    ///
    /// If the item has not completed yet, its completion callback fires now
    /// with [`ExecutionError::Cancelled`] and the eventual result is dropped.
    /// The work itself still runs. Returns true if this call detached the
    /// waiter; false if the item had already completed.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Returns true once the completion callback has fired.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.control.is_completed()
    }

    /// Returns true if the waiter was detached before the result arrived.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("completed", &self.is_completed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A submitted work item whose result is delivered to this value.
///
/// Returned by [`TransactionalExecutor::call`](super::TransactionalExecutor::call).
/// Dropping a `Pending` does not cancel the work.
#[derive(Debug)]
pub struct Pending<V> {
    handle: WorkHandle,
    rx: oneshot::Receiver<RxResult<V>>,
}

impl<V: Send + 'static> Pending<V> {
    pub(crate) fn new(handle: WorkHandle, rx: oneshot::Receiver<RxResult<V>>) -> Self {
        Self { handle, rx }
    }

    /// The underlying work handle.
    #[must_use]
    pub const fn handle(&self) -> &WorkHandle {
        &self.handle
    }

    /// Detaches the waiter; see [`WorkHandle::cancel`].
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Blocks until the result arrives.
    ///
    /// Must not be called from inside an async runtime; await
    /// [`into_awaitable`](Self::into_awaitable) there instead.
    pub fn join(self) -> RxResult<V> {
        self.rx.blocking_recv().map_err(|_| disconnected())?
    }

    /// Returns the result if it has arrived.
    pub fn try_result(&mut self) -> Option<RxResult<V>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(disconnected())),
        }
    }

    /// Converts into a future. Dropping the future before it resolves
    /// detaches the waiter.
    #[must_use]
    pub fn into_awaitable(self) -> Awaitable<V> {
        Awaitable::new(self.handle, self.rx)
    }
}

pub(crate) fn disconnected() -> RxError {
    RxError::Execution(ExecutionError::Disconnected {
        path: "executor".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counting() -> (Arc<Completion<u32>>, Arc<Mutex<Vec<RxResult<u32>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let completion = Completion::new(Box::new(move |r: RxResult<u32>| sink.lock().unwrap().push(r)));
        (completion, seen)
    }

    #[test]
    fn completes_exactly_once() {
        let (completion, seen) = counting();
        assert!(completion.complete(Ok(1)));
        assert!(!completion.complete(Ok(2)));
        assert_eq!(*seen.lock().unwrap(), vec![Ok(1)]);
    }

    #[test]
    fn cancel_then_result_fires_once_with_cancelled() {
        let (completion, seen) = counting();
        let handle = WorkHandle::new(Arc::clone(&completion));
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!completion.complete(Ok(5)));

        assert!(handle.is_completed());
        assert!(handle.is_cancelled());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].as_ref().unwrap_err().is_cancelled());
    }

    #[test]
    fn cancel_after_completion_is_a_no_op() {
        let (completion, seen) = counting();
        let handle = WorkHandle::new(Arc::clone(&completion));
        completion.complete(Ok(3));
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
        assert_eq!(*seen.lock().unwrap(), vec![Ok(3)]);
    }

    #[test]
    fn racing_cancel_and_complete_fire_callback_once() {
        for _ in 0..64 {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let completion = Completion::new(Box::new(move |_: RxResult<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            let handle = WorkHandle::new(Arc::clone(&completion));

            thread::scope(|s| {
                s.spawn(|| handle.cancel());
                s.spawn(|| handle.cancel());
                s.spawn(|| completion.complete(Ok(1)));
            });
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn panicking_callback_is_contained() {
        let completion: Arc<Completion<u32>> = Completion::new(Box::new(|_: RxResult<u32>| panic!("callback bug")));
        assert!(completion.complete(Ok(1)));
        assert!(!completion.complete(Ok(2)));
    }

    #[test]
    fn pending_try_result_and_join() {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(Box::new(move |r: RxResult<u32>| {
            let _ = tx.send(r);
        }));
        let mut pending = Pending::new(WorkHandle::new(Arc::clone(&completion)), rx);
        assert!(pending.try_result().is_none());
        completion.complete(Ok(9));
        assert_eq!(pending.join(), Ok(9));
    }

    #[test]
    fn cancelled_pending_joins_with_cancelled() {
        let (tx, rx) = oneshot::channel();
        let completion = Completion::new(Box::new(move |r: RxResult<u32>| {
            let _ = tx.send(r);
        }));
        let pending = Pending::new(WorkHandle::new(Arc::clone(&completion)), rx);
        assert!(pending.cancel());
        completion.complete(Ok(1));
        assert!(pending.join().unwrap_err().is_cancelled());
    }
}
