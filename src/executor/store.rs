//! Transactional store interface and an in-memory reference store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ExecutionError, RxResult};
use crate::reactive::ValuePublisher;

/// Isolation requested by a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxMode {
    /// Read-only; may run concurrently with other readers.
    Read,
    /// Exclusive; serialized against every other writer.
    Write,
}

/// Storage backend driven by [`AsyncExecutor`](super::AsyncExecutor).
///
/// The executor enforces reader/writer exclusion before calling `begin`, so
/// implementations only need to provide the transactional scope itself.
pub trait TxStore: Send + Sync + 'static {
    /// Transaction handle passed to work closures.
    type Tx: Send + 'static;

    /// Opens a transaction.
    fn begin(&self, mode: TxMode) -> RxResult<Self::Tx>;

    /// Makes the transaction's writes visible.
    fn commit(&self, tx: Self::Tx) -> RxResult<()>;

    /// Discards the transaction.
    fn abort(&self, tx: Self::Tx);

    /// Delivers change notifications queued by earlier commits.
    ///
    /// The executor calls this after a write transaction, once the writer
    /// gate is released, so observers never run while holding it. Stores
    /// without notifications keep the default.
    fn flush_notifications(&self) {}
}

/// Copy-on-write transactional cell holding one value of `D`.
///
/// Every committed write replaces the value and queues it on the cell's
/// [`ValuePublisher`]. Queued values are delivered in commit order by
/// [`flush_notifications`](TxStore::flush_notifications), or by any other
/// thread already delivering for the same publisher.
#[derive(Debug)]
pub struct MemoryCell<D> {
    data: RwLock<Arc<D>>,
    publisher: Arc<ValuePublisher<D>>,
    commits: AtomicU64,
}

impl<D: Clone + Send + Sync + 'static> MemoryCell<D> {
    /// Creates a cell; `initial` is also the publisher's current value.
    #[must_use]
    pub fn new(initial: D) -> Self {
        Self {
            publisher: Arc::new(ValuePublisher::with_initial(initial.clone())),
            data: RwLock::new(Arc::new(initial)),
            commits: AtomicU64::new(0),
        }
    }

    /// The last committed value.
    #[must_use]
    pub fn get(&self) -> Arc<D> {
        Arc::clone(&self.data.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publisher notified on every committed write.
    #[must_use]
    pub fn publisher(&self) -> Arc<ValuePublisher<D>> {
        Arc::clone(&self.publisher)
    }

    /// Number of committed writes that changed the value.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }
}

impl<D: Clone + Send + Sync + 'static> TxStore for MemoryCell<D> {
    type Tx = CellTx<D>;

    fn begin(&self, mode: TxMode) -> RxResult<CellTx<D>> {
        Ok(CellTx {
            mode,
            base: self.get(),
            working: None,
        })
    }

    fn commit(&self, tx: CellTx<D>) -> RxResult<()> {
        let Some(working) = tx.working else {
            return Ok(());
        };
        if tx.mode == TxMode::Read {
            return Err(ExecutionError::ReadOnlyTransaction.into());
        }

        let committed = Arc::new(working);
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&committed);
        let seq = self.commits.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(commit = seq, "memory cell committed");
        self.publisher.publish_deferred(D::clone(&committed));
        Ok(())
    }

    fn abort(&self, tx: CellTx<D>) {
        if tx.working.is_some() {
            trace!("memory cell transaction discarded");
        }
    }

    fn flush_notifications(&self) {
        self.publisher.flush();
    }
}

/// Transaction over a [`MemoryCell`].
///
/// Reads see the value committed when the transaction began. The first call
/// to [`get_mut`](Self::get_mut) copies it into a private working value.
#[derive(Debug)]
pub struct CellTx<D> {
    mode: TxMode,
    base: Arc<D>,
    working: Option<D>,
}

impl<D: Clone> CellTx<D> {
    /// The transaction's mode.
    #[must_use]
    pub const fn mode(&self) -> TxMode {
        self.mode
    }

    /// The value as seen by this transaction, including its own writes.
    #[must_use]
    pub fn get(&self) -> &D {
        self.working.as_ref().unwrap_or(&*self.base)
    }

    /// Mutable access; fails in read transactions.
    pub fn get_mut(&mut self) -> RxResult<&mut D> {
        if self.mode == TxMode::Read {
            return Err(ExecutionError::ReadOnlyTransaction.into());
        }
        let base = &self.base;
        Ok(self.working.get_or_insert_with(|| D::clone(base)))
    }

    /// Replaces the value.
    pub fn set(&mut self, value: D) -> RxResult<()> {
        *self.get_mut()? = value;
        Ok(())
    }

    /// Returns true once the transaction has written.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.working.is_some()
    }
}
