//! Cancelable buffered sequence fed by a subscription.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::error::{ExecutionError, RxError, RxResult, StreamError};
use crate::reactive::{CancelHandle, Subscription};

use super::backpressure::{BackpressurePolicy, Offer, PolicyBuffer};

#[derive(Debug, Clone)]
enum Status {
    Open,
    Closed,
    Failed(RxError),
}

struct StreamState<T> {
    buffer: PolicyBuffer<T>,
    status: Status,
    dropped: u64,
}

/// State shared between a stream's consumer and its producer.
///
/// Producers hold it weakly, so a dropped consumer is never kept alive by a
/// publisher.
pub(crate) struct StreamShared<T> {
    state: Mutex<StreamState<T>>,
    ready: Condvar,
    space: Condvar,
    upstream: Mutex<Option<CancelHandle>>,
}

impl<T> StreamShared<T> {
    pub(crate) fn new(policy: BackpressurePolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StreamState {
                buffer: PolicyBuffer::new(policy),
                status: Status::Open,
                dropped: 0,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
            upstream: Mutex::new(None),
        })
    }

    pub(crate) fn new_checked(policy: BackpressurePolicy) -> RxResult<Arc<Self>> {
        policy.validate()?;
        Ok(Self::new(policy))
    }

    /// Links the subscription to cancel on termination. If the stream already
    /// terminated while the subscription was being built, cancels it now.
    pub(crate) fn link(&self, handle: CancelHandle) {
        *self.upstream.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        if !self.is_open() {
            self.detach();
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.lock().status, Status::Open)
    }

    /// Offers one item under the stream's policy. Returns false once the
    /// stream no longer accepts items.
    pub(crate) fn push(&self, mut item: T) -> bool {
        let mut state = self.lock();
        loop {
            if !matches!(state.status, Status::Open) {
                return false;
            }
            match state.buffer.offer(item) {
                Offer::Accepted => {
                    drop(state);
                    self.ready.notify_one();
                    return true;
                }
                Offer::Dropped(n) => {
                    state.dropped += n as u64;
                    trace!(dropped = n, policy = ?state.buffer.policy(), "stream discarded items");
                    drop(state);
                    self.ready.notify_one();
                    return true;
                }
                Offer::Rejected(err) => {
                    if let StreamError::MissingBackpressure { capacity } = &err {
                        error!(capacity, "producer outpaced a stream without a backpressure strategy");
                    }
                    state.status = Status::Failed(RxError::Stream(err));
                    drop(state);
                    self.terminated();
                    return false;
                }
                Offer::Full(back) => {
                    item = back;
                    state = self.space.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Terminates the stream with `error` unless it already terminated.
    pub(crate) fn fail(&self, error: RxError) -> bool {
        {
            let mut state = self.lock();
            if !matches!(state.status, Status::Open) {
                return false;
            }
            debug!(error = %error, "stream failed");
            state.status = Status::Failed(error);
        }
        self.terminated();
        true
    }

    /// Ends the stream gracefully because its upstream went away. Unlike
    /// [`close`](Self::close), buffered items stay readable; readers see
    /// `Closed` once they are drained.
    pub(crate) fn finish(&self) -> bool {
        {
            let mut state = self.lock();
            if !matches!(state.status, Status::Open) {
                return false;
            }
            state.status = Status::Closed;
        }
        debug!("stream finished by its subscription");
        self.terminated();
        true
    }

    /// Closes the stream gracefully unless it already terminated. Buffered
    /// items are discarded.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.lock();
            if !matches!(state.status, Status::Open) {
                return false;
            }
            state.status = Status::Closed;
            state.buffer.clear();
        }
        debug!("stream closed");
        self.terminated();
        true
    }

    fn terminated(&self) {
        self.ready.notify_all();
        self.space.notify_all();
        self.detach();
    }

    fn detach(&self) {
        let upstream = self.upstream.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    fn take(&self, deadline: Option<Instant>) -> RxResult<Option<T>> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.buffer.pop() {
                drop(state);
                self.space.notify_one();
                return Ok(Some(item));
            }
            match &state.status {
                Status::Closed => return Err(StreamError::Closed.into()),
                Status::Failed(err) => return Err(err.clone()),
                Status::Open => {}
            }
            state = match deadline {
                None => self.ready.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cancelable, blocking sequence of items pushed by a subscription.
///
/// Reads block while the buffer is empty. The stream ends exactly once:
/// [`close`](Self::close) (or dropping the stream) ends it gracefully and
/// cancels the subscription. A subscription cancelled from elsewhere ends it
/// gracefully too, after the items already buffered. An overflow under
/// `Error`/`Missing` or an upstream failure ends it with a terminal error,
/// which readers observe after draining the items buffered before it.
pub struct BufferedStream<T> {
    shared: Arc<StreamShared<T>>,
    subscription: Option<Subscription>,
}

impl<T> BufferedStream<T> {
    pub(crate) fn new(shared: Arc<StreamShared<T>>, subscription: Option<Subscription>) -> Self {
        if let Some(subscription) = &subscription {
            shared.link(subscription.cancel_handle());
        }
        Self { shared, subscription }
    }

    /// Blocks until an item is available or the stream ends.
    pub fn recv(&self) -> RxResult<T> {
        match self.shared.take(None)? {
            Some(item) => Ok(item),
            None => Err(RxError::internal("stream woke without an item")),
        }
    }

    /// Like [`recv`](Self::recv), failing with `Timeout` after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> RxResult<T> {
        let deadline = Instant::now() + timeout;
        self.shared.take(Some(deadline))?.ok_or_else(|| {
            RxError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        })
    }

    /// Returns a buffered item without blocking.
    pub fn try_recv(&self) -> RxResult<Option<T>> {
        self.shared.take(Some(Instant::now()))
    }

    /// Ends the stream and cancels the subscription. Idempotent; returns
    /// true if this call closed it.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Returns true once the stream ended, gracefully or not.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.shared.is_open()
    }

    /// The error that terminated the stream, if it did not end gracefully.
    #[must_use]
    pub fn terminal_error(&self) -> Option<RxError> {
        match &self.shared.lock().status {
            Status::Failed(err) => Some(err.clone()),
            Status::Open | Status::Closed => None,
        }
    }

    /// Items discarded by the backpressure policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }

    /// Items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The stream's backpressure policy.
    #[must_use]
    pub fn policy(&self) -> BackpressurePolicy {
        self.shared.lock().buffer.policy()
    }

    /// The feeding subscription, if the stream has one of its own.
    #[must_use]
    pub const fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }
}

impl<T> Iterator for BufferedStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv().ok()
    }
}

impl<T> Drop for BufferedStream<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T> std::fmt::Debug for BufferedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("BufferedStream")
            .field("policy", &state.buffer.policy())
            .field("status", &state.status)
            .field("buffered", &state.buffer.len())
            .field("dropped", &state.dropped)
            .finish()
    }
}
