//! Transactional work execution.
//!
//! [`AsyncExecutor`] runs closures on a bounded worker pool, each inside one
//! transaction of a [`TxStore`]. Every submission completes exactly once.
//! Cancelling a handle detaches the waiter but never stops the work: callers
//! may rely on a submitted item's side effects happening.

/// Worker pool and the submission interface.
pub mod pool;
/// Store interface and the in-memory reference store.
pub mod store;
/// Completion guard and handles.
pub mod work;

pub use pool::{AsyncExecutor, ExecutorConfig, TransactionalExecutor};
pub use store::{CellTx, MemoryCell, TxMode, TxStore};
pub use work::{OnDone, Pending, WorkHandle};
