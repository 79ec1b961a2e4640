//! # kyrorx - Reactive bridge for change notifications and transactional work
//!
//! kyrorx sits between a storage engine that pushes change notifications from
//! arbitrary threads and application code that wants to consume them
//! comfortably. It provides:
//!
//! - **Publisher / Subscription**: weakly held observers, idempotent
//!   cancellation, optional transform, replay, deliver-once and scheduler
//!   marshaling
//! - **AsyncExecutor**: a bounded worker pool running closures inside store
//!   transactions, completing each submission exactly once
//! - **Bridge**: blocking streams with backpressure policies, awaitable
//!   executor calls and hot multicast snapshot streams
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kyrorx::{bridge, AsyncExecutor, BackpressurePolicy, ExecutorConfig, MemoryCell, TransactionalExecutor, TxMode};
//!
//! let executor = AsyncExecutor::new(MemoryCell::new(Vec::<String>::new()), ExecutorConfig::default())?;
//! let updates = bridge::as_stream(
//!     bridge::subscribe(executor.store().publisher()).only_changes(),
//!     BackpressurePolicy::Latest,
//! )?;
//!
//! executor
//!     .call(TxMode::Write, |tx| {
//!         tx.get_mut()?.push("hello".to_string());
//!         Ok(())
//!     })?
//!     .join()?;
//!
//! assert_eq!(updates.recv()?.len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;

// Push side
pub mod reactive;

// Work side
pub mod executor;

// Consumer adapters
pub mod bridge;

pub use error::{ExecutionError, RxError, RxResult, StreamError, ValidationError};

pub use reactive::{
    CancelHandle, DataObserver, ErrorObserver, InlineScheduler, ObserverError, ObserverErrorKind, ObserverId,
    ObserverResult, Publisher, Scheduler, SchedulerConfig, Subscription, SubscriptionBuilder, SubscriptionId,
    SubscriptionList, SubscriptionStatus, ThreadScheduler, ValuePublisher, WeakObserverRegistry,
};

pub use executor::{
    AsyncExecutor, CellTx, ExecutorConfig, MemoryCell, Pending, TransactionalExecutor, TxMode, TxStore, WorkHandle,
};

pub use bridge::{Awaitable, BackpressurePolicy, BufferedStream, Snapshot, SnapshotConsumer, SnapshotStream};
