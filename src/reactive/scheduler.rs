//! Schedulers marshal observer callbacks onto a caller-chosen context.
//!
//! Publishers call observers on whatever thread triggered the change. A
//! subscription built with `.on(scheduler)` instead posts each delivery to a
//! [`Scheduler`], e.g. a [`ThreadScheduler`] that runs everything on one
//! dedicated thread in submission order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{ExecutionError, RxError, RxResult};

use super::observer::panic_message;

/// A unit of work posted to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on some execution context.
pub trait Scheduler: Send + Sync {
    /// Posts `task`. Must not block on the task's execution.
    fn schedule(&self, task: Task) -> RxResult<()>;
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, task: Task) -> RxResult<()> {
        task();
        Ok(())
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Max queued tasks before `schedule` reports `QueueFull`.
    pub queue_capacity: usize,
    /// Name of the scheduler thread.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            thread_name: "kyrorx-scheduler".to_string(),
        }
    }
}

/// Serialized execution context backed by one dedicated thread.
///
/// Tasks run in the order they were scheduled. A panicking task is logged and
/// does not stop the thread.
#[derive(Debug)]
pub struct ThreadScheduler {
    tx: Sender<Task>,
    capacity: usize,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Spawns the scheduler thread.
    pub fn new(cfg: SchedulerConfig) -> RxResult<Self> {
        let capacity = cfg.queue_capacity.max(1);
        let (tx, rx) = bounded::<Task>(capacity);
        let name = cfg.thread_name.clone();
        let join = thread::Builder::new()
            .name(cfg.thread_name)
            .spawn(move || run_tasks(&rx))
            .map_err(|e| {
                RxError::Execution(ExecutionError::SpawnFailed {
                    name,
                    message: e.to_string(),
                })
            })?;

        Ok(Self {
            tx,
            capacity,
            thread_id: join.thread().id(),
            join: Mutex::new(Some(join)),
        })
    }

    /// Returns true when called from the scheduler thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, task: Task) -> RxResult<()> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RxError::Execution(ExecutionError::QueueFull {
                path: "scheduler".to_string(),
                capacity: self.capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(RxError::Execution(ExecutionError::Disconnected {
                path: "scheduler".to_string(),
            })),
        }
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        // Close the channel first so the thread drains queued tasks and exits.
        let (dummy_tx, _) = bounded::<Task>(1);
        drop(std::mem::replace(&mut self.tx, dummy_tx));

        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            // Joining from the scheduler thread itself would wait forever.
            if self.is_current() {
                drop(handle);
            } else if handle.join().is_err() {
                error!("scheduler thread terminated abnormally");
            }
        }
    }
}

fn run_tasks(rx: &Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            error!(panic = %panic_message(payload.as_ref()), "scheduled task panicked");
        }
    }
    debug!("scheduler thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn inline_runs_immediately() {
        let hit = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&hit);
        InlineScheduler
            .schedule(Box::new(move || *flag.lock().unwrap() = true))
            .unwrap();
        assert!(*hit.lock().unwrap());
    }

    #[test]
    fn thread_scheduler_preserves_order_and_thread() {
        let scheduler = ThreadScheduler::new(SchedulerConfig::default()).unwrap();
        let (tx, rx) = bounded::<(usize, ThreadId)>(16);
        for i in 0..8 {
            let tx = tx.clone();
            scheduler
                .schedule(Box::new(move || {
                    tx.send((i, thread::current().id())).unwrap();
                }))
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut threads = Vec::new();
        for _ in 0..8 {
            let (i, id) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            seen.push(i);
            threads.push(id);
        }
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        assert!(threads.iter().all(|id| *id == threads[0]));
        assert_ne!(threads[0], thread::current().id());
    }

    #[test]
    fn panicking_task_does_not_kill_the_thread() {
        let scheduler = ThreadScheduler::new(SchedulerConfig::default()).unwrap();
        scheduler.schedule(Box::new(|| panic!("task bug"))).unwrap();

        let (tx, rx) = bounded::<u8>(1);
        scheduler
            .schedule(Box::new(move || {
                tx.send(1).unwrap();
            }))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
    }

    #[test]
    fn full_queue_is_reported() {
        let scheduler = ThreadScheduler::new(SchedulerConfig {
            queue_capacity: 1,
            thread_name: "kyrorx-test-scheduler".to_string(),
        })
        .unwrap();

        let (block_tx, block_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        scheduler
            .schedule(Box::new(move || {
                started_tx.send(()).unwrap();
                let _ = block_rx.recv();
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        scheduler.schedule(Box::new(|| {})).unwrap();
        let err = scheduler.schedule(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, RxError::Execution(ExecutionError::QueueFull { capacity: 1, .. })));
        drop(block_tx);
    }

    #[test]
    fn config_parses_with_defaults() {
        let cfg: SchedulerConfig = serde_json::from_str(r#"{"queue_capacity": 8}"#).unwrap();
        assert_eq!(cfg.queue_capacity, 8);
        assert_eq!(cfg.thread_name, "kyrorx-scheduler");
    }
}
