//! Bounded worker pool running work items inside store transactions.
//!
//! Submission never blocks: jobs go through a bounded crossbeam channel and a
//! full queue is reported as `QueueFull`. Write items are serialized by the
//! executor's own reader/writer gate; read items run concurrently.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{ExecutionError, RxError, RxResult};
use crate::reactive::observer::panic_message;

use super::store::{TxMode, TxStore};
use super::work::{Completion, Pending, WorkHandle};

/// Executor configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub thread_name_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            thread_name_prefix: "kyrorx-worker".to_string(),
        }
    }
}

/// Submission interface used by the data-access layer.
pub trait TransactionalExecutor {
    /// Transaction type handed to work closures.
    type Tx;

    /// Queues `work` to run in a transaction of the given `mode`.
    ///
    /// `on_done` fires exactly once with the work's result, with the error it
    /// returned, or with `Cancelled` if the handle was cancelled first. If
    /// the queue rejects the item, the error is returned here and `on_done`
    /// is dropped without being called.
    fn submit<V, W, D>(&self, mode: TxMode, work: W, on_done: D) -> RxResult<WorkHandle>
    where
        V: Send + 'static,
        W: FnOnce(&mut Self::Tx) -> RxResult<V> + Send + 'static,
        D: FnOnce(RxResult<V>) + Send + 'static;

    /// Queues `work` and returns a [`Pending`] result.
    fn call<V, W>(&self, mode: TxMode, work: W) -> RxResult<Pending<V>>
    where
        V: Send + 'static,
        W: FnOnce(&mut Self::Tx) -> RxResult<V> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = self.submit(mode, work, move |result: RxResult<V>| {
            // The receiver is gone if the caller dropped its Pending.
            let _ = tx.send(result);
        })?;
        Ok(Pending::new(handle, rx))
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(prefix: &str, workers: usize, queue_capacity: usize) -> RxResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let thread_name = format!("{prefix}-{idx}");
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&rx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop the workers already started before reporting.
                    Self {
                        tx,
                        workers: handles,
                        queue_capacity,
                    }
                    .shutdown();
                    return Err(RxError::Execution(ExecutionError::SpawnFailed {
                        name: thread_name,
                        message: e.to_string(),
                    }));
                }
            }
        }

        Ok(Self {
            tx,
            workers: handles,
            queue_capacity,
        })
    }

    fn idle() -> Self {
        Self {
            tx: bounded::<Job>(1).0,
            workers: Vec::new(),
            queue_capacity: 1,
        }
    }

    fn try_submit(&self, job: Job) -> RxResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RxError::Execution(ExecutionError::QueueFull {
                path: "executor".to_string(),
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(RxError::Execution(ExecutionError::Disconnected {
                path: "executor".to_string(),
            })),
        }
    }

    fn shutdown(self) {
        // Close the channel: workers drain queued jobs then exit.
        drop(self.tx);
        let current = thread::current().id();
        for handle in self.workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("executor worker terminated abnormally");
            }
        }
    }
}

fn worker_loop(rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            error!(panic = %panic_message(payload.as_ref()), "executor job panicked");
        }
    }
}

/// Bounded thread-pool executor over a [`TxStore`].
pub struct AsyncExecutor<S: TxStore> {
    store: Arc<S>,
    gate: Arc<RwLock<()>>,
    pool: WorkerPool,
    workers: usize,
    submitted: AtomicU64,
    finished: Arc<AtomicU64>,
}

impl<S: TxStore> AsyncExecutor<S> {
    /// Starts the worker threads.
    pub fn new(store: S, config: ExecutorConfig) -> RxResult<Self> {
        Self::with_shared_store(Arc::new(store), config)
    }

    /// Starts the worker threads over a store shared with other code.
    pub fn with_shared_store(store: Arc<S>, config: ExecutorConfig) -> RxResult<Self> {
        let pool = WorkerPool::start(&config.thread_name_prefix, config.workers, config.queue_capacity)?;
        debug!(workers = pool.workers.len(), capacity = pool.queue_capacity, "executor started");
        Ok(Self {
            store,
            gate: Arc::new(RwLock::new(())),
            workers: pool.workers.len(),
            pool,
            submitted: AtomicU64::new(0),
            finished: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.workers
    }

    /// Items accepted so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Items whose work has finished running, cancelled waiters included.
    #[must_use]
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Acquire)
    }

    /// Items waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.pool.tx.len()
    }

    /// Stops accepting work, lets queued items finish and joins the workers.
    /// Later submissions fail with `Disconnected`. Idempotent.
    pub fn shutdown(&mut self) {
        let pool = std::mem::replace(&mut self.pool, WorkerPool::idle());
        if !pool.workers.is_empty() {
            pool.shutdown();
            debug!("executor stopped");
        }
    }
}

impl<S: TxStore> TransactionalExecutor for AsyncExecutor<S> {
    type Tx = S::Tx;

    fn submit<V, W, D>(&self, mode: TxMode, work: W, on_done: D) -> RxResult<WorkHandle>
    where
        V: Send + 'static,
        W: FnOnce(&mut S::Tx) -> RxResult<V> + Send + 'static,
        D: FnOnce(RxResult<V>) + Send + 'static,
    {
        let completion = Completion::new(Box::new(on_done));
        let handle = WorkHandle::new(Arc::clone(&completion));

        let store = Arc::clone(&self.store);
        let gate = Arc::clone(&self.gate);
        let finished = Arc::clone(&self.finished);
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(|| run_in_tx(store.as_ref(), &gate, mode, work)))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "transaction store panicked");
                    Err(RxError::Execution(ExecutionError::WorkPanicked { message }))
                });
            // The writer gate is released by now.
            if mode == TxMode::Write {
                store.flush_notifications();
            }
            finished.fetch_add(1, Ordering::AcqRel);
            completion.complete(result);
        });

        self.pool.try_submit(job)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }
}

impl<S: TxStore> Drop for AsyncExecutor<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<S: TxStore> std::fmt::Debug for AsyncExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("workers", &self.workers)
            .field("queued", &self.queued())
            .field("submitted", &self.submitted())
            .field("finished", &self.finished())
            .finish_non_exhaustive()
    }
}

fn run_in_tx<S, V, W>(store: &S, gate: &RwLock<()>, mode: TxMode, work: W) -> RxResult<V>
where
    S: TxStore,
    W: FnOnce(&mut S::Tx) -> RxResult<V>,
{
    // Single writer, many readers.
    let _read = (mode == TxMode::Read).then(|| gate.read().unwrap_or_else(PoisonError::into_inner));
    let _write = (mode == TxMode::Write).then(|| gate.write().unwrap_or_else(PoisonError::into_inner));

    let mut tx = store.begin(mode)?;
    match catch_unwind(AssertUnwindSafe(|| work(&mut tx))) {
        Ok(Ok(value)) => {
            match mode {
                TxMode::Write => store.commit(tx)?,
                TxMode::Read => store.abort(tx),
            }
            Ok(value)
        }
        Ok(Err(err)) => {
            store.abort(tx);
            Err(err)
        }
        Err(payload) => {
            store.abort(tx);
            let message = panic_message(payload.as_ref());
            error!(panic = %message, ?mode, "work item panicked");
            Err(RxError::Execution(ExecutionError::WorkPanicked { message }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::executor::store::MemoryCell;

    fn executor(workers: usize, queue_capacity: usize) -> AsyncExecutor<MemoryCell<u64>> {
        AsyncExecutor::new(
            MemoryCell::new(0),
            ExecutorConfig {
                workers,
                queue_capacity,
                thread_name_prefix: "kyrorx-test-worker".to_string(),
            },
        )
        .unwrap()
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn write_commits_and_returns_value() {
        let exec = executor(2, 16);
        let pending = exec
            .call(TxMode::Write, |tx| {
                *tx.get_mut()? += 5;
                Ok(*tx.get())
            })
            .unwrap();
        assert_eq!(pending.join(), Ok(5));
        assert_eq!(*exec.store().get(), 5);
    }

    #[test]
    fn failed_write_is_aborted() {
        let exec = executor(1, 16);
        let result = exec
            .call(TxMode::Write, |tx| -> RxResult<()> {
                *tx.get_mut()? = 99;
                Err(RxError::work("validation failed"))
            })
            .unwrap()
            .join();
        assert_eq!(result, Err(RxError::work("validation failed")));
        assert_eq!(*exec.store().get(), 0);
    }

    #[test]
    fn panicking_work_reports_and_worker_survives() {
        let exec = executor(1, 16);
        let err = exec
            .call(TxMode::Write, |_tx| -> RxResult<u64> { panic!("work bug") })
            .unwrap()
            .join()
            .unwrap_err();
        assert!(matches!(err, RxError::Execution(ExecutionError::WorkPanicked { ref message }) if message == "work bug"));

        let ok = exec.call(TxMode::Read, |tx| Ok(*tx.get())).unwrap().join();
        assert_eq!(ok, Ok(0));
    }

    #[test]
    fn on_done_fires_exactly_once() {
        let exec = executor(2, 16);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        exec.submit(TxMode::Read, |tx| Ok(*tx.get()), move |_r: RxResult<u64>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn writers_are_serialized() {
        let exec = executor(4, 64);
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let mut pending = Vec::new();
        for _ in 0..16 {
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            pending.push(
                exec.call(TxMode::Write, move |tx| {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(1));
                    *tx.get_mut()? += 1;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap(),
            );
        }
        for p in pending {
            p.join().unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
        assert_eq!(*exec.store().get(), 16);
    }

    #[test]
    fn readers_run_concurrently() {
        let exec = executor(2, 16);
        let arrived = Arc::new(AtomicUsize::new(0));
        let mut pending = Vec::new();
        for _ in 0..2 {
            let arrived = Arc::clone(&arrived);
            pending.push(
                exec.call(TxMode::Read, move |_tx| {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    let deadline = Instant::now() + Duration::from_secs(2);
                    // Each reader waits for the other one to be inside its transaction.
                    while arrived.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Ok(arrived.load(Ordering::SeqCst))
                })
                .unwrap(),
            );
        }
        for p in pending {
            assert_eq!(p.join(), Ok(2));
        }
    }

    #[test]
    fn full_queue_rejects_without_calling_on_done() {
        let exec = executor(1, 1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let blocker = exec
            .call(TxMode::Read, move |_tx| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let queued = exec.call(TxMode::Read, |_tx| Ok(())).unwrap();

        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        let err = exec
            .submit(TxMode::Read, |_tx| Ok(()), move |_r: RxResult<()>| {
                *flag.lock().unwrap() = true;
            })
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, RxError::Execution(ExecutionError::QueueFull { capacity: 1, .. })));

        drop(release_tx);
        blocker.join().unwrap();
        queued.join().unwrap();
        assert!(!*called.lock().unwrap());
        assert_eq!(exec.submitted(), 2);
    }

    #[test]
    fn shutdown_drains_accepted_items() {
        let mut exec = executor(1, 32);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            exec.submit(
                TxMode::Write,
                move |tx| {
                    *tx.get_mut()? += 1;
                    Ok(())
                },
                move |_r: RxResult<()>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        }
        exec.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(*exec.store().get(), 10);

        let err = exec.call(TxMode::Read, |_tx| Ok(())).unwrap_err();
        assert!(matches!(err, RxError::Execution(ExecutionError::Disconnected { .. })));
    }

    #[test]
    fn config_parses_with_defaults() {
        let cfg: ExecutorConfig = serde_json::from_str(r#"{"workers": 2}"#).unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.thread_name_prefix, "kyrorx-worker");
    }
}
