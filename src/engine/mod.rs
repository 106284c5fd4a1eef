//! Storage engines
//!
//! An [`Engine`] owns the full state of one table (or one shard of one
//! table): an in-memory multi-version row cache plus a durable XML file.
//! [`cached::CachedDocumentEngine`] is the real store;
//! [`sharded::IdShardedEngine`] composes many cached engines behind the
//! same trait, keyed by value intervals.

pub mod cached;
pub mod interval;
pub mod row;
pub mod sharded;
mod state;

pub use state::EngineState;
pub(crate) use state::StateCell;

use std::sync::Arc;

use xmltree::Element;

use crate::error::Result;
use crate::query::{RowMatcher, RowUpdate};
use crate::txn::{Transaction, TransactionId};

/// The per-table storage contract.
///
/// All row operations require the engine to be running; a call arriving
/// while the engine is spinning up blocks until it is, and fails once the
/// engine starts spinning down. Lifecycle methods drive the state machine
/// `Uninitialized → SpinningUp → SpunUp → Running → SpinningDown →
/// SpunDown`.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> EngineState;

    /// Create a new row. Fails with `DuplicateKey` when a version visible
    /// to the current transaction already exists and is not a tombstone.
    fn insert_row(&self, id: &str, element: Element) -> Result<()>;

    /// A clone of the row content visible to the current transaction.
    fn read_row(&self, id: &str) -> Result<Option<Element>>;

    /// Replace an existing row. Fails with `KeyNotFound` when no version
    /// is visible.
    fn replace_row(&self, id: &str, element: Element) -> Result<()>;

    /// Apply `update` to the visible version of one row. A new version is
    /// installed only when the update changed the content; returns whether
    /// it did. Fails with `KeyNotFound` when no version is visible.
    fn update_row(&self, id: &str, update: &dyn RowUpdate) -> Result<bool>;

    /// Apply `update` to every row accepted by `matcher`; returns the
    /// number of rows changed.
    fn update_matching(&self, matcher: &dyn RowMatcher, update: &dyn RowUpdate) -> Result<usize>;

    /// Insert or replace; returns true when this was an insert.
    fn upsert_row(&self, id: &str, element: Element) -> Result<bool>;

    /// Install a deletion tombstone. Fails with `KeyNotFound` when no
    /// version is visible.
    fn delete_row(&self, id: &str) -> Result<()>;

    /// Tombstone every row accepted by `matcher`; returns the count.
    fn delete_matching(&self, matcher: &dyn RowMatcher) -> Result<usize>;

    /// Cursor over the rows accepted by `matcher`, evaluated lazily under
    /// the calling transaction. The engine will not finish spinning down
    /// while the cursor is open.
    fn query(&self, matcher: Arc<dyn RowMatcher>) -> Result<RowCursor>;

    /// Assign `tx`'s commit id to every version it wrote here. Fails with
    /// `WriteConflict` under snapshot isolation when a row was committed by
    /// someone else after `tx` started.
    fn commit(&self, tx: &Transaction) -> Result<()>;

    /// Remove every version written by `tx_id`. With `recovering` the whole
    /// cache is scanned instead of only the uncommitted set.
    fn revert(&self, tx_id: TransactionId, recovering: bool) -> Result<()>;

    /// Load the durable file into the cache. Returns true for the caller
    /// that performed the spin-up; that caller must also invoke
    /// [`Engine::begin_operations`].
    fn spin_up(&self) -> Result<bool>;

    /// Start background maintenance and open the engine for operations.
    fn begin_operations(&self) -> Result<()>;

    /// Graceful shutdown: final cleanup, durable dump, wait for open
    /// cursors, then stop. Idempotent on an already spun-down engine.
    fn spin_down(&self) -> Result<()>;

    /// Immediate shutdown without a final dump.
    fn force_spin_down(&self) -> Result<()>;

    /// True while any cached row carries an uncommitted version.
    fn has_uncommitted_data(&self) -> bool;

    /// Write engine state onto the table's metadata element.
    fn save_metadata(&self, element: &mut Element);

    /// Restore engine state from the table's metadata element.
    fn load_metadata(&self, element: &Element);
}

/// Lazily evaluated query result.
pub struct RowCursor {
    inner: Box<dyn Iterator<Item = Result<Element>> + Send>,
}

impl RowCursor {
    pub(crate) fn new(inner: Box<dyn Iterator<Item = Result<Element>> + Send>) -> Self {
        Self { inner }
    }

    pub fn empty() -> Self {
        Self {
            inner: Box::new(std::iter::empty()),
        }
    }

    /// Drain the cursor, failing on the first error.
    pub fn collect_rows(self) -> Result<Vec<Element>> {
        self.collect()
    }
}

impl Iterator for RowCursor {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
