//! Transaction manager
//!
//! Allocates transaction and commit ids from one monotonic, time-based
//! sequence, tracks the current transaction per thread, remembers which
//! engines each transaction has written to, and drives commit and revert
//! across all of them. A single manager instance is shared by every engine
//! of a database and passed in explicitly at construction.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use crate::engine::Engine;
use crate::error::{Result, XFlatError};
use crate::txn::journal::Journal;
use crate::txn::{Transaction, TransactionId, TransactionOptions};

pub struct TransactionManager {
    last_id: AtomicI64,
    open: DashMap<TransactionId, Arc<Transaction>>,
    committed: DashMap<TransactionId, i64>,
    reverted: DashSet<TransactionId>,
    current: DashMap<ThreadId, TransactionId>,
    bindings: DashMap<TransactionId, Vec<(String, Weak<dyn Engine>)>>,
    journal: Option<Mutex<Journal>>,
}

impl TransactionManager {
    /// Manager without crash recovery (no journal on disk).
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_id: AtomicI64::new(0),
            open: DashMap::new(),
            committed: DashMap::new(),
            reverted: DashSet::new(),
            current: DashMap::new(),
            bindings: DashMap::new(),
            journal: None,
        })
    }

    /// Manager journaling open-transaction state to `path`. Call
    /// [`TransactionManager::recover`] with the spun-up engines before
    /// accepting new work.
    pub fn with_journal(path: std::path::PathBuf) -> Result<Arc<Self>> {
        let journal = Journal::open(path)?;
        let state = journal.replay()?;
        let manager = Self {
            last_id: AtomicI64::new(state.max_id),
            open: DashMap::new(),
            committed: DashMap::new(),
            reverted: DashSet::new(),
            current: DashMap::new(),
            bindings: DashMap::new(),
            journal: Some(Mutex::new(journal)),
        };
        for (tx, commit) in state.committed {
            manager.committed.insert(tx, commit);
        }
        Ok(Arc::new(manager))
    }

    /// Allocate the next globally ordered id. Time-based so a higher id
    /// means a later start, and clamped to `last + 1` so the sequence stays
    /// strictly monotonic even if the wall clock steps backwards.
    fn allocate_id(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let prev = self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(0);
        now.max(prev + 1)
    }

    /// Fresh commit id for an auto-committed (transactionless) write.
    pub fn transactionless_commit_id(&self) -> i64 {
        self.allocate_id()
    }

    /// Open a transaction bound to the calling thread.
    pub fn open_transaction(
        self: &Arc<Self>,
        options: TransactionOptions,
    ) -> Result<TransactionScope> {
        let thread = std::thread::current().id();
        if self.current.contains_key(&thread) {
            return Err(XFlatError::IllegalTransactionState(
                "a transaction is already open on this thread".into(),
            ));
        }

        let id = self.allocate_id();
        let tx = Arc::new(Transaction::new(id, options));
        if let Some(journal) = &self.journal {
            journal.lock().record_open(id)?;
        }
        self.open.insert(id, Arc::clone(&tx));
        self.current.insert(thread, id);
        tracing::debug!(tx = id, ?options, "transaction opened");

        Ok(TransactionScope {
            manager: Arc::clone(self),
            tx,
            thread,
            resolved: AtomicBool::new(false),
        })
    }

    /// The transaction bound to the calling thread, if any.
    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        let thread = std::thread::current().id();
        let id = *self.current.get(&thread)?;
        self.open.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn any_open_transactions(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn open_transaction_ids(&self) -> std::collections::BTreeSet<TransactionId> {
        self.open.iter().map(|e| *e.key()).collect()
    }

    /// The commit id of `tx_id`, or `None` while it has not committed.
    pub fn is_transaction_committed(&self, tx_id: TransactionId) -> Option<i64> {
        self.committed.get(&tx_id).map(|e| *e.value())
    }

    pub fn is_transaction_reverted(&self, tx_id: TransactionId) -> bool {
        self.reverted.contains(&tx_id)
    }

    /// Remember that `engine` holds data written by `tx_id`, so commit and
    /// revert reach it.
    pub fn bind_engine_to_transaction(&self, tx_id: TransactionId, engine: &Arc<dyn Engine>) {
        let mut entry = self.bindings.entry(tx_id).or_default();
        let name = engine.name();
        if !entry.iter().any(|(n, _)| n == name) {
            entry.push((name.to_string(), Arc::downgrade(engine)));
        }
    }

    /// Drop `engine_name`'s binding from every transaction not listed in
    /// `keep`. Engines call this after a maintenance pass with the set of
    /// transactions still referenced by their cache.
    pub fn unbind_engine_except_from(
        &self,
        engine_name: &str,
        keep: &std::collections::BTreeSet<TransactionId>,
    ) {
        for mut entry in self.bindings.iter_mut() {
            if keep.contains(entry.key()) {
                continue;
            }
            entry.value_mut().retain(|(name, _)| name != engine_name);
        }
    }

    fn bound_engines(&self, tx_id: TransactionId) -> Vec<Arc<dyn Engine>> {
        self.bindings
            .get(&tx_id)
            .map(|entry| {
                entry
                    .iter()
                    .filter_map(|(_, weak)| weak.upgrade())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn do_commit(&self, tx: &Arc<Transaction>) -> Result<()> {
        if !tx.is_open() {
            return Err(XFlatError::IllegalTransactionState(format!(
                "transaction {} is not open",
                tx.id()
            )));
        }

        let commit_id = self.allocate_id();
        tx.set_commit_id(commit_id);

        let engines = self.bound_engines(tx.id());
        for engine in &engines {
            if let Err(err) = engine.commit(tx) {
                tracing::warn!(
                    tx = tx.id(),
                    engine = engine.name(),
                    error = %err,
                    "commit rejected, reverting on all bound engines"
                );
                // Engines earlier in the list already assigned commit ids;
                // revert removes those versions again.
                self.finish_revert(tx.id(), &engines);
                tx.mark_reverted();
                return Err(err);
            }
        }

        if let Some(journal) = &self.journal {
            let mut journal = journal.lock();
            journal.record_commit(tx.id(), commit_id)?;
            journal.record_close(tx.id())?;
        }
        self.committed.insert(tx.id(), commit_id);
        tx.mark_committed();
        self.open.remove(&tx.id());
        self.bindings.remove(&tx.id());
        tracing::debug!(tx = tx.id(), commit = commit_id, "transaction committed");
        Ok(())
    }

    fn do_revert(&self, tx: &Arc<Transaction>) {
        let engines = self.bound_engines(tx.id());
        self.finish_revert(tx.id(), &engines);
        tx.mark_reverted();
    }

    fn finish_revert(&self, tx_id: TransactionId, engines: &[Arc<dyn Engine>]) {
        for engine in engines {
            if let Err(err) = engine.revert(tx_id, false) {
                tracing::warn!(tx = tx_id, engine = engine.name(), error = %err, "revert failed");
            }
        }
        if let Some(journal) = &self.journal {
            let _ = journal.lock().record_close(tx_id);
        }
        self.reverted.insert(tx_id);
        self.open.remove(&tx_id);
        self.bindings.remove(&tx_id);
        tracing::debug!(tx = tx_id, "transaction reverted");
    }

    /// Revert every journaled transaction that never committed, against all
    /// supplied engines, then reset the journal. Engines must be spun up.
    pub fn recover(&self, engines: &[Arc<dyn Engine>]) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let mut journal = journal.lock();
        let state = journal.replay()?;
        for tx_id in state.unresolved {
            tracing::info!(tx = tx_id, "recovering unresolved transaction");
            for engine in engines {
                engine.revert(tx_id, true).map_err(|e| {
                    XFlatError::Recovery(format!(
                        "revert of transaction {tx_id} on {} failed: {e}",
                        engine.name()
                    ))
                })?;
            }
            self.reverted.insert(tx_id);
        }
        journal.truncate()?;
        Ok(())
    }
}

/// RAII handle to an open transaction. Dropping an unresolved scope reverts
/// the transaction.
pub struct TransactionScope {
    manager: Arc<TransactionManager>,
    tx: Arc<Transaction>,
    thread: ThreadId,
    resolved: AtomicBool,
}

impl TransactionScope {
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }

    pub fn id(&self) -> TransactionId {
        self.tx.id()
    }

    /// Commit on every engine the transaction touched. Any engine rejection
    /// reverts the transaction everywhere and surfaces the engine's error.
    pub fn commit(&self) -> Result<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Err(XFlatError::IllegalTransactionState(format!(
                "transaction {} already resolved",
                self.tx.id()
            )));
        }
        self.release_thread();
        self.manager.do_commit(&self.tx)
    }

    /// Revert on every engine the transaction touched.
    pub fn revert(&self) -> Result<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Err(XFlatError::IllegalTransactionState(format!(
                "transaction {} already resolved",
                self.tx.id()
            )));
        }
        self.release_thread();
        self.manager.do_revert(&self.tx);
        Ok(())
    }

    fn release_thread(&self) {
        self.manager
            .current
            .remove_if(&self.thread, |_, id| *id == self.tx.id());
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.resolved.swap(true, Ordering::SeqCst) {
            self.release_thread();
            self.manager.do_revert(&self.tx);
        }
    }
}
