//! Transactions
//!
//! Transaction and commit ids come from one shared, time-based, strictly
//! monotonic allocator, so a greater id always means "later in global
//! time" — that ordering is the only coordination that exists across
//! engines. Visibility and conflict rules are enforced inside each engine;
//! the manager here tracks which engines a transaction touched and drives
//! commit and revert across all of them.

mod journal;
mod manager;

pub use manager::{TransactionManager, TransactionScope};

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

/// Transaction ids and commit ids share this signed 64-bit space.
pub type TransactionId = i64;

/// Sentinel commit id of a version whose transaction has not committed.
pub const UNCOMMITTED: i64 = -1;

/// Isolation behaviours distinguished by the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Readers see the latest committed state; commits never conflict.
    #[default]
    ReadCommitted,
    /// Readers see the state as of transaction start; a commit fails when
    /// another transaction committed to the same row after that start.
    Snapshot,
}

/// Options fixed at transaction open.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    pub isolation: Isolation,
    /// Force a synchronous durable dump on every engine at commit.
    pub durable: bool,
}

impl TransactionOptions {
    pub fn snapshot() -> Self {
        Self {
            isolation: Isolation::Snapshot,
            ..Default::default()
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TransactionStatus {
    Open = 0,
    Committed = 1,
    Reverted = 2,
}

/// An open (or recently resolved) transaction.
///
/// The id is assigned at open; the commit id stays [`UNCOMMITTED`] until
/// the manager commits the transaction, and is never rewritten afterwards.
pub struct Transaction {
    id: TransactionId,
    options: TransactionOptions,
    commit_id: AtomicI64,
    status: AtomicU8,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, options: TransactionOptions) -> Self {
        Self {
            id,
            options,
            commit_id: AtomicI64::new(UNCOMMITTED),
            status: AtomicU8::new(TransactionStatus::Open as u8),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn isolation(&self) -> Isolation {
        self.options.isolation
    }

    /// The commit id, or [`UNCOMMITTED`] while the transaction is open.
    pub fn commit_id(&self) -> i64 {
        self.commit_id.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.status.load(Ordering::Acquire) == TransactionStatus::Open as u8
    }

    pub fn is_committed(&self) -> bool {
        self.status.load(Ordering::Acquire) == TransactionStatus::Committed as u8
    }

    pub fn is_reverted(&self) -> bool {
        self.status.load(Ordering::Acquire) == TransactionStatus::Reverted as u8
    }

    pub(crate) fn set_commit_id(&self, commit_id: i64) {
        self.commit_id.store(commit_id, Ordering::Release);
    }

    pub(crate) fn mark_committed(&self) {
        self.status
            .store(TransactionStatus::Committed as u8, Ordering::Release);
    }

    pub(crate) fn mark_reverted(&self) {
        self.status
            .store(TransactionStatus::Reverted as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("commit_id", &self.commit_id())
            .field("isolation", &self.options.isolation)
            .finish()
    }
}
