//! Cached document engine
//!
//! Keeps an entire table in memory as an MVCC row cache and durably dumps
//! it to one XML file. Mutations go to per-row version cells; a background
//! maintenance task discards versions no transaction can observe and drops
//! rows that are down to tombstones. Durable dumps are coalesced so a burst
//! of writes produces one file write.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use xmltree::Element;

use crate::config::TableConfig;
use crate::engine::row::{Row, RowData, UNCOMMITTED};
use crate::engine::{Engine, EngineState, RowCursor, StateCell};
use crate::error::{Result, XFlatError};
use crate::query::{RowMatcher, RowUpdate};
use crate::scheduler::{CancellationToken, Completion, TaskPool};
use crate::txn::{Isolation, Transaction, TransactionId, TransactionManager};
use crate::xml;

/// Whole-file dump retries on transient file-not-found errors.
const DUMP_RETRY_ATTEMPTS: u32 = 3;
const DUMP_RETRY_PAUSE: Duration = Duration::from_millis(50);
/// After this many accumulated dump failures the next writer joins the
/// pending dump so the error surfaces synchronously.
const DUMP_FAILURE_SYNC_THRESHOLD: u32 = 5;
/// Every n-th maintenance pass walks the whole cache instead of only the
/// uncommitted set.
const FULL_SWEEP_EVERY: u64 = 10;
const SPIN_DOWN_DUMP_ATTEMPTS: u32 = 3;

/// Concurrent row map. Once the engine has spun down the cache is marked
/// inactive and every access fails, so no late caller can observe a
/// half-torn table.
struct DocumentCache {
    rows: DashMap<String, Arc<Row>>,
    inactive: AtomicBool,
}

impl DocumentCache {
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
            inactive: AtomicBool::new(false),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inactive.load(Ordering::Acquire) {
            return Err(XFlatError::EngineState(
                "engine is spun down; cache is no longer accessible".into(),
            ));
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Arc<Row>>> {
        self.ensure_active()?;
        Ok(self.rows.get(id).map(|e| Arc::clone(e.value())))
    }

    fn get_or_insert(&self, id: &str) -> Result<Arc<Row>> {
        self.ensure_active()?;
        Ok(Arc::clone(
            self.rows
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Row::new(id)))
                .value(),
        ))
    }

    fn insert(&self, row: Arc<Row>) {
        self.rows.insert(row.row_id().to_string(), row);
    }

    fn remove(&self, id: &str) {
        self.rows.remove(id);
    }

    fn row_ids(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        Ok(self.rows.iter().map(|e| e.key().clone()).collect())
    }

    fn rows(&self) -> Result<Vec<Arc<Row>>> {
        self.ensure_active()?;
        Ok(self.rows.iter().map(|e| Arc::clone(e.value())).collect())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn clear(&self) {
        self.rows.clear();
    }

    fn set_inactive(&self) {
        self.inactive.store(true, Ordering::Release);
        self.rows.clear();
    }
}

/// Open query cursors. Spin-down blocks until the set drains; the mutex
/// and condvar exist only to signal that drain, membership itself is
/// lock-free.
struct CursorRegistry {
    open: DashSet<u64>,
    signal: Mutex<()>,
    drained: Condvar,
    next: AtomicU64,
}

impl CursorRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: DashSet::new(),
            signal: Mutex::new(()),
            drained: Condvar::new(),
            next: AtomicU64::new(1),
        })
    }

    fn register(&self) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.open.insert(id);
        id
    }

    fn unregister(&self, id: u64) {
        self.open.remove(&id);
        if self.open.is_empty() {
            // taken so a waiter between its emptiness check and the wait
            // cannot miss the notification
            let _guard = self.signal.lock();
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut guard = self.signal.lock();
        while !self.open.is_empty() {
            self.drained.wait(&mut guard);
        }
    }
}

struct CursorGuard {
    registry: Arc<CursorRegistry>,
    id: u64,
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

struct DumpState {
    pending: Option<Completion>,
    last_dump: Option<Instant>,
    failures: u32,
}

#[derive(Default)]
struct Counters {
    dumps: AtomicU64,
    dump_failures: AtomicU64,
    maintenance_passes: AtomicU64,
    rows_dropped: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub cached_rows: usize,
    pub dumps: u64,
    pub dump_failures: u64,
    pub maintenance_passes: u64,
    pub rows_dropped: u64,
}

struct WriteContext {
    tx: Option<Arc<Transaction>>,
    transaction_id: i64,
    commit_id: i64,
}

pub struct CachedDocumentEngine {
    name: String,
    file: PathBuf,
    config: TableConfig,
    txns: Arc<TransactionManager>,
    pool: Arc<TaskPool>,
    state: StateCell,
    cache: DocumentCache,
    /// Rows that may carry uncommitted versions; also the fast path for the
    /// maintenance sweep.
    uncommitted: DashMap<String, Arc<Row>>,
    /// Coarse readers-writer lock over the cache. Held exclusively for
    /// physical row removal and during spin-up/spin-down.
    table_lock: RwLock<()>,
    /// Serialises commit/revert against each other and the maintenance
    /// sweep.
    sync_root: Mutex<()>,
    /// Transaction currently mid-commit, or [`UNCOMMITTED`].
    currently_committing: AtomicI64,
    dump: Mutex<DumpState>,
    counters: Counters,
    cursors: Arc<CursorRegistry>,
    maintenance_token: Mutex<Option<CancellationToken>>,
    on_spin_down: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    weak_self: Weak<CachedDocumentEngine>,
}

impl CachedDocumentEngine {
    pub fn new(
        name: impl Into<String>,
        file: PathBuf,
        config: TableConfig,
        txns: Arc<TransactionManager>,
        pool: Arc<TaskPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            file,
            config,
            txns,
            pool,
            state: StateCell::new(),
            cache: DocumentCache::new(),
            uncommitted: DashMap::new(),
            table_lock: RwLock::new(()),
            sync_root: Mutex::new(()),
            currently_committing: AtomicI64::new(UNCOMMITTED),
            dump: Mutex::new(DumpState {
                pending: None,
                last_dump: None,
                failures: 0,
            }),
            counters: Counters::default(),
            cursors: CursorRegistry::new(),
            maintenance_token: Mutex::new(None),
            on_spin_down: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn file(&self) -> &std::path::Path {
        &self.file
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cached_rows: self.cache.len(),
            dumps: self.counters.dumps.load(Ordering::Relaxed),
            dump_failures: self.counters.dump_failures.load(Ordering::Relaxed),
            maintenance_passes: self.counters.maintenance_passes.load(Ordering::Relaxed),
            rows_dropped: self.counters.rows_dropped.load(Ordering::Relaxed),
        }
    }

    /// Callback fired once when the engine reaches `SpunDown`.
    pub fn set_spin_down_listener(&self, listener: impl FnOnce() + Send + 'static) {
        *self.on_spin_down.lock() = Some(Box::new(listener));
    }

    fn ensure_running(&self) -> Result<()> {
        self.state.await_running(&self.name)
    }

    fn as_dyn(&self) -> Option<Arc<dyn Engine>> {
        self.weak_self
            .upgrade()
            .map(|arc| arc as Arc<dyn Engine>)
    }

    /// Resolve the writer identity for a mutation: the current transaction
    /// when one is open on this thread (binding this engine to it),
    /// otherwise a fresh auto-commit id used as both transaction and
    /// commit id.
    fn begin_write(&self) -> Result<WriteContext> {
        self.ensure_running()?;
        match self.txns.current_transaction() {
            Some(tx) => {
                if let Some(me) = self.as_dyn() {
                    self.txns.bind_engine_to_transaction(tx.id(), &me);
                }
                Ok(WriteContext {
                    transaction_id: tx.id(),
                    commit_id: UNCOMMITTED,
                    tx: Some(tx),
                })
            }
            None => {
                let id = self.txns.transactionless_commit_id();
                Ok(WriteContext {
                    tx: None,
                    transaction_id: id,
                    commit_id: id,
                })
            }
        }
    }

    fn version(&self, ctx: &WriteContext, id: &str, element: Option<Element>) -> RowData {
        RowData {
            row_id: id.to_string(),
            transaction_id: ctx.transaction_id,
            commit_id: ctx.commit_id,
            element,
        }
    }

    /// Post-mutation bookkeeping: track the row for the maintenance sweep
    /// while any transaction is open anywhere, and schedule a durable dump.
    fn finish_write(&self, row: &Arc<Row>) -> Result<()> {
        if self.txns.any_open_transactions() {
            self.uncommitted
                .insert(row.row_id().to_string(), Arc::clone(row));
        }
        self.schedule_dump()
    }

    /// One maintenance pass. Every [`FULL_SWEEP_EVERY`]-th pass walks the
    /// whole cache; the others only the uncommitted set.
    pub fn maintenance_pass(&self) -> Result<()> {
        let pass = self.counters.maintenance_passes.fetch_add(1, Ordering::SeqCst) + 1;
        self.run_cleanup(pass % FULL_SWEEP_EVERY == 0)
    }

    fn run_cleanup(&self, full: bool) -> Result<()> {
        // serialise the sweep against commit and revert
        let _sync = self.sync_root.lock();
        let open = self.txns.open_transaction_ids();
        let candidates: Vec<Arc<Row>> = if full {
            self.cache.rows()?
        } else {
            self.uncommitted.iter().map(|e| Arc::clone(e.value())).collect()
        };

        let mut droppable = Vec::new();
        for row in &candidates {
            if row.cleanup(&open) {
                droppable.push(Arc::clone(row));
            } else if !row.has_uncommitted() {
                self.uncommitted.remove(row.row_id());
            }
        }

        let mut dropped = 0u64;
        if !droppable.is_empty() {
            let _write = self.table_lock.write();
            for row in droppable {
                // re-check: a writer may have raced a new version in
                if row.cleanup(&open) {
                    self.cache.remove(row.row_id());
                    self.uncommitted.remove(row.row_id());
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.counters.rows_dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::debug!(table = %self.name, dropped, "maintenance dropped rows");
        }

        // release this engine from transactions that no longer reference it
        let mut referenced = BTreeSet::new();
        for entry in self.uncommitted.iter() {
            for tx_id in entry.value().uncommitted_transaction_ids() {
                referenced.insert(tx_id);
            }
        }
        self.txns.unbind_engine_except_from(&self.name, &referenced);

        if dropped > 0 {
            self.schedule_dump()?;
        }
        Ok(())
    }

    fn collect_committed(&self) -> Result<Vec<(String, Vec<RowData>)>> {
        let _read = self.table_lock.read();
        Ok(self
            .cache
            .rows()?
            .iter()
            .map(|row| (row.row_id().to_string(), row.committed_versions()))
            .collect())
    }

    fn perform_dump(&self) -> Result<()> {
        let rows = self.collect_committed()?;
        let doc = xml::build_table_document(&self.name, &rows);
        let mut attempt = 0;
        loop {
            match xml::write_document(&self.file, &doc) {
                Ok(()) => {
                    self.counters.dumps.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                // transient on platforms with open memory-mapped views
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < DUMP_RETRY_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(table = %self.name, attempt, "dump hit file-not-found, retrying");
                    std::thread::sleep(DUMP_RETRY_PAUSE);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Immediate durable dump on the calling thread.
    pub fn dump_cache_now(&self) -> Result<()> {
        let result = self.perform_dump();
        let mut dump = self.dump.lock();
        match &result {
            Ok(()) => {
                dump.last_dump = Some(Instant::now());
                dump.failures = 0;
            }
            Err(err) => {
                dump.failures += 1;
                self.counters.dump_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(table = %self.name, error = %err, failures = dump.failures, "dump failed");
            }
        }
        result
    }

    /// Deferred durable dump. Dumps coalesce: at most one deferred dump is
    /// pending, and it runs no sooner than one coalescing window after the
    /// previous dump. Once failures accumulate past the threshold the
    /// calling writer is held on the dump instead, so the error reaches a
    /// caller.
    pub fn dump_cache(&self) -> Result<()> {
        self.schedule_dump()
    }

    fn schedule_dump(&self) -> Result<()> {
        let mut dump = self.dump.lock();
        if dump.failures >= DUMP_FAILURE_SYNC_THRESHOLD {
            let pending = dump.pending.clone();
            drop(dump);
            return match pending {
                Some(pending) => pending.wait().map_err(XFlatError::Dump),
                None => self.dump_cache_now(),
            };
        }
        if dump.pending.is_some() {
            return Ok(());
        }

        let window = Duration::from_millis(self.config.dump_coalesce_ms);
        let delay = match dump.last_dump {
            Some(last) => window.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };
        let completion = Completion::new();
        dump.pending = Some(completion.clone());
        drop(dump);

        let weak = self.weak_self.clone();
        self.pool.schedule_after(delay, move || match weak.upgrade() {
            Some(engine) => engine.run_deferred_dump(),
            None => completion.complete_err("engine dropped before dump"),
        });
        Ok(())
    }

    fn run_deferred_dump(&self) {
        let Some(completion) = self.dump.lock().pending.take() else {
            return;
        };
        match self.dump_cache_now() {
            Ok(()) => completion.complete_ok(),
            Err(err) => completion.complete_err(err.to_string()),
        }
    }
}

impl Engine for CachedDocumentEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EngineState {
        self.state.get()
    }

    fn insert_row(&self, id: &str, element: Element) -> Result<()> {
        let ctx = self.begin_write()?;
        let row = {
            let _read = self.table_lock.read();
            let row = self.cache.get_or_insert(id)?;
            row.insert_version(ctx.tx.as_deref(), self.version(&ctx, id, Some(element)))?;
            row
        };
        self.finish_write(&row)
    }

    fn read_row(&self, id: &str) -> Result<Option<Element>> {
        self.ensure_running()?;
        let tx = self.txns.current_transaction();
        let _read = self.table_lock.read();
        let Some(row) = self.cache.get(id)? else {
            return Ok(None);
        };
        Ok(row
            .choose_most_recent_committed(tx.as_deref(), i64::MAX)
            .and_then(|data| data.element))
    }

    fn replace_row(&self, id: &str, element: Element) -> Result<()> {
        let ctx = self.begin_write()?;
        let row = {
            let _read = self.table_lock.read();
            let Some(row) = self.cache.get(id)? else {
                return Err(XFlatError::KeyNotFound(id.to_string()));
            };
            row.replace_version(ctx.tx.as_deref(), self.version(&ctx, id, Some(element)))?;
            row
        };
        self.finish_write(&row)
    }

    fn update_row(&self, id: &str, update: &dyn RowUpdate) -> Result<bool> {
        let ctx = self.begin_write()?;
        let (row, changed) = {
            let _read = self.table_lock.read();
            let Some(row) = self.cache.get(id)? else {
                return Err(XFlatError::KeyNotFound(id.to_string()));
            };
            let changed =
                row.update_version(ctx.tx.as_deref(), ctx.transaction_id, ctx.commit_id, update)?;
            (row, changed)
        };
        if changed {
            self.finish_write(&row)?;
        }
        Ok(changed)
    }

    fn update_matching(&self, matcher: &dyn RowMatcher, update: &dyn RowUpdate) -> Result<usize> {
        let ctx = self.begin_write()?;
        let any_open = self.txns.any_open_transactions();
        let mut changed = 0;
        {
            let _read = self.table_lock.read();
            for row in self.cache.rows()? {
                let Some(data) = row.choose_most_recent_committed(ctx.tx.as_deref(), i64::MAX)
                else {
                    continue;
                };
                let Some(element) = &data.element else {
                    continue;
                };
                if !matcher.matches(row.row_id(), element) {
                    continue;
                }
                match row.update_version(
                    ctx.tx.as_deref(),
                    ctx.transaction_id,
                    ctx.commit_id,
                    update,
                ) {
                    Ok(true) => {
                        changed += 1;
                        if any_open {
                            self.uncommitted
                                .insert(row.row_id().to_string(), Arc::clone(&row));
                        }
                    }
                    Ok(false) => {}
                    // the visible version vanished between match and update
                    Err(XFlatError::KeyNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        if changed > 0 {
            self.schedule_dump()?;
        }
        Ok(changed)
    }

    fn upsert_row(&self, id: &str, element: Element) -> Result<bool> {
        let ctx = self.begin_write()?;
        let (row, inserted) = {
            let _read = self.table_lock.read();
            let row = self.cache.get_or_insert(id)?;
            let inserted =
                row.upsert_version(ctx.tx.as_deref(), self.version(&ctx, id, Some(element)));
            (row, inserted)
        };
        self.finish_write(&row)?;
        Ok(inserted)
    }

    fn delete_row(&self, id: &str) -> Result<()> {
        let ctx = self.begin_write()?;
        let row = {
            let _read = self.table_lock.read();
            let Some(row) = self.cache.get(id)? else {
                return Err(XFlatError::KeyNotFound(id.to_string()));
            };
            row.delete_version(ctx.tx.as_deref(), self.version(&ctx, id, None))?;
            row
        };
        self.finish_write(&row)
    }

    fn delete_matching(&self, matcher: &dyn RowMatcher) -> Result<usize> {
        let ctx = self.begin_write()?;
        let any_open = self.txns.any_open_transactions();
        let mut deleted = 0;
        {
            let _read = self.table_lock.read();
            for row in self.cache.rows()? {
                let Some(data) = row.choose_most_recent_committed(ctx.tx.as_deref(), i64::MAX)
                else {
                    continue;
                };
                let Some(element) = &data.element else {
                    continue;
                };
                if !matcher.matches(row.row_id(), element) {
                    continue;
                }
                match row.delete_version(
                    ctx.tx.as_deref(),
                    self.version(&ctx, row.row_id(), None),
                ) {
                    Ok(()) => {
                        deleted += 1;
                        if any_open {
                            self.uncommitted
                                .insert(row.row_id().to_string(), Arc::clone(&row));
                        }
                    }
                    Err(XFlatError::KeyNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        if deleted > 0 {
            self.schedule_dump()?;
        }
        Ok(deleted)
    }

    fn query(&self, matcher: Arc<dyn RowMatcher>) -> Result<RowCursor> {
        self.ensure_running()?;
        let tx = self.txns.current_transaction();
        let ids = self.cache.row_ids()?;
        let guard = CursorGuard {
            registry: Arc::clone(&self.cursors),
            id: self.cursors.register(),
        };
        let weak = self.weak_self.clone();
        let mut index = 0;

        let iter = std::iter::from_fn(move || {
            let _open = &guard;
            loop {
                if index >= ids.len() {
                    return None;
                }
                let id = &ids[index];
                index += 1;

                let Some(engine) = weak.upgrade() else {
                    return Some(Err(XFlatError::EngineState("engine dropped".into())));
                };
                let row = match engine.cache.get(id) {
                    Ok(Some(row)) => row,
                    Ok(None) => continue,
                    Err(err) => return Some(Err(err)),
                };
                let Some(data) = row.choose_most_recent_committed(tx.as_deref(), i64::MAX) else {
                    continue;
                };
                let Some(element) = data.element else {
                    continue;
                };
                if matcher.matches(row.row_id(), &element) {
                    return Some(Ok(element));
                }
            }
        });
        Ok(RowCursor::new(Box::new(iter)))
    }

    fn commit(&self, tx: &Transaction) -> Result<()> {
        let commit_id = tx.commit_id();
        if commit_id == UNCOMMITTED {
            return Err(XFlatError::IllegalTransactionState(format!(
                "transaction {} has no commit id assigned",
                tx.id()
            )));
        }

        let sync = self.sync_root.lock();
        let committing = self.currently_committing.load(Ordering::Acquire);
        if committing != UNCOMMITTED
            && committing != tx.id()
            && self.txns.is_transaction_committed(committing).is_none()
        {
            return Err(XFlatError::TransactionState(format!(
                "transaction {committing} is mid-commit on table {}",
                self.name
            )));
        }
        self.currently_committing.store(tx.id(), Ordering::Release);

        let rows: Vec<Arc<Row>> = self
            .uncommitted
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        if tx.isolation() == Isolation::Snapshot {
            for row in &rows {
                if row.has_version_of(tx.id()) && row.has_committed_after(tx.id(), tx.id()) {
                    self.currently_committing
                        .store(UNCOMMITTED, Ordering::Release);
                    return Err(XFlatError::WriteConflict(format!(
                        "row {} was committed after transaction {} started",
                        row.row_id(),
                        tx.id()
                    )));
                }
            }
        }

        for row in &rows {
            row.assign_commit_id(tx.id(), commit_id);
        }
        drop(sync);

        if tx.options().durable {
            self.dump_cache_now()
        } else {
            self.schedule_dump()
        }
    }

    fn revert(&self, tx_id: TransactionId, recovering: bool) -> Result<()> {
        let sync = self.sync_root.lock();
        let rows: Vec<Arc<Row>> = if recovering {
            self.cache.rows()?
        } else {
            self.uncommitted
                .iter()
                .map(|e| Arc::clone(e.value()))
                .collect()
        };

        let mut dump_needed = false;
        for row in rows {
            if let Some(removed) = row.remove_version(tx_id) {
                // a version that had a real commit id may already be on disk
                dump_needed |= removed.is_committed();
            }
        }
        if self.currently_committing.load(Ordering::Acquire) == tx_id {
            self.currently_committing
                .store(UNCOMMITTED, Ordering::Release);
        }
        drop(sync);

        if dump_needed {
            self.dump_cache_now()?;
        }
        Ok(())
    }

    fn spin_up(&self) -> Result<bool> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !self
            .state
            .transition(EngineState::Uninitialized, EngineState::SpinningUp)
        {
            return Ok(false);
        }
        tracing::info!(table = %self.name, file = %self.file.display(), "spinning up");

        {
            let _write = self.table_lock.write();
            if self.file.exists() {
                let doc = match xml::read_document(&self.file) {
                    Ok(doc) => doc,
                    Err(err) => {
                        // a half-populated cache must never become visible
                        self.cache.clear();
                        self.state.force(EngineState::Uninitialized);
                        return Err(err);
                    }
                };
                for (id, versions) in xml::parse_table_document(&doc) {
                    self.cache.insert(Arc::new(Row::from_versions(&id, versions)));
                }
            }
        }

        self.state.transition(EngineState::SpinningUp, EngineState::SpunUp);
        Ok(true)
    }

    fn begin_operations(&self) -> Result<()> {
        {
            let mut slot = self.maintenance_token.lock();
            if slot.is_none() {
                let token = CancellationToken::new();
                *slot = Some(token.clone());
                let weak = self.weak_self.clone();
                let task_token = token.clone();
                self.pool.schedule_periodic(
                    Duration::from_millis(self.config.maintenance_interval_ms),
                    token,
                    move || {
                        let Some(engine) = weak.upgrade() else {
                            task_token.cancel();
                            return;
                        };
                        if engine.state.get() >= EngineState::SpinningDown {
                            task_token.cancel();
                            return;
                        }
                        if let Err(err) = engine.maintenance_pass() {
                            tracing::warn!(table = %engine.name, error = %err, "maintenance pass failed");
                        }
                    },
                );
            }
        }

        if !self.state.transition(EngineState::SpunUp, EngineState::Running) {
            return Err(XFlatError::EngineState(format!(
                "engine {} cannot begin operations from state {}",
                self.name,
                self.state.get()
            )));
        }
        Ok(())
    }

    fn spin_down(&self) -> Result<()> {
        {
            let _write = self.table_lock.write();
            if !self
                .state
                .transition(EngineState::Running, EngineState::SpinningDown)
            {
                return match self.state.get() {
                    EngineState::SpunDown => Ok(()),
                    state => Err(XFlatError::EngineState(format!(
                        "engine {} cannot spin down from state {state}",
                        self.name
                    ))),
                };
            }
        }
        tracing::info!(table = %self.name, "spinning down");

        if let Some(token) = self.maintenance_token.lock().take() {
            token.cancel();
        }
        if let Err(err) = self.run_cleanup(true) {
            tracing::warn!(table = %self.name, error = %err, "final cleanup failed");
        }

        let mut dump_result = Ok(());
        for attempt in 1..=SPIN_DOWN_DUMP_ATTEMPTS {
            dump_result = self.dump_cache_now();
            match &dump_result {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(table = %self.name, attempt, error = %err, "spin-down dump failed")
                }
            }
        }
        dump_result?;

        // outstanding deferred dump and open cursors must settle first
        let pending = self.dump.lock().pending.clone();
        if let Some(pending) = pending {
            let _ = pending.wait();
        }
        self.cursors.wait_drained();

        self.state
            .transition(EngineState::SpinningDown, EngineState::SpunDown);
        self.cache.set_inactive();
        if let Some(listener) = self.on_spin_down.lock().take() {
            listener();
        }
        Ok(())
    }

    fn force_spin_down(&self) -> Result<()> {
        if let Some(token) = self.maintenance_token.lock().take() {
            token.cancel();
        }
        self.state.force(EngineState::SpunDown);
        self.cache.set_inactive();
        if let Some(listener) = self.on_spin_down.lock().take() {
            listener();
        }
        Ok(())
    }

    fn has_uncommitted_data(&self) -> bool {
        self.uncommitted
            .iter()
            .any(|entry| entry.value().has_uncommitted())
    }

    fn save_metadata(&self, _element: &mut Element) {
        // cached engines keep no engine-specific metadata; the id generator
        // writes its own state through the table metadata
    }

    fn load_metadata(&self, _element: &Element) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ChildEquals, MatchAll, SetChildText};
    use crate::txn::TransactionOptions;
    use std::sync::mpsc;

    fn test_config() -> TableConfig {
        TableConfig {
            dump_coalesce_ms: 10,
            // background sweeps stay out of the way; tests drive passes
            maintenance_interval_ms: 3_600_000,
            ..Default::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: Arc<TaskPool>,
        txns: Arc<TransactionManager>,
        file: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let file = dir.path().join("table.xml");
            Self {
                _dir: dir,
                pool: TaskPool::new(2),
                txns: TransactionManager::new(),
                file,
            }
        }

        fn engine(&self) -> Arc<CachedDocumentEngine> {
            let engine = CachedDocumentEngine::new(
                "table",
                self.file.clone(),
                test_config(),
                Arc::clone(&self.txns),
                Arc::clone(&self.pool),
            );
            assert!(engine.spin_up().unwrap());
            engine.begin_operations().unwrap();
            engine
        }
    }

    fn element(text: &str) -> Element {
        let mut el = Element::new("x");
        xml::set_text(&mut el, text);
        el
    }

    fn text(el: &Element) -> String {
        xml::text_of(el)
    }

    #[test]
    fn insert_then_read_and_durable_file() {
        let fx = Fixture::new();
        let engine = fx.engine();

        engine.insert_row("a", element("1")).unwrap();
        assert_eq!(text(&engine.read_row("a").unwrap().unwrap()), "1");

        engine.dump_cache_now().unwrap();
        let doc = xml::read_document(&fx.file).unwrap();
        let rows = xml::parse_table_document(&doc);
        assert_eq!(rows.len(), 1);
        let (id, versions) = &rows[0];
        assert_eq!(id, "a");
        assert_eq!(versions.len(), 1);
        // an auto-committed write carries one id as both tx and commit
        assert_eq!(versions[0].transaction_id, versions[0].commit_id);
        assert_eq!(text(versions[0].element.as_ref().unwrap()), "1");
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("a", element("1")).unwrap();
        assert!(matches!(
            engine.insert_row("a", element("2")),
            Err(XFlatError::DuplicateKey(_))
        ));
    }

    #[test]
    fn missing_rows_surface_key_not_found() {
        let fx = Fixture::new();
        let engine = fx.engine();
        assert!(matches!(
            engine.replace_row("nope", element("1")),
            Err(XFlatError::KeyNotFound(_))
        ));
        assert!(matches!(
            engine.delete_row("nope"),
            Err(XFlatError::KeyNotFound(_))
        ));
        assert!(matches!(
            engine.update_row("nope", &SetChildText::new("y", "1")),
            Err(XFlatError::KeyNotFound(_))
        ));
        assert!(engine.read_row("nope").unwrap().is_none());
    }

    #[test]
    fn upsert_reports_inserts() {
        let fx = Fixture::new();
        let engine = fx.engine();
        assert!(engine.upsert_row("a", element("1")).unwrap());
        assert!(!engine.upsert_row("a", element("2")).unwrap());
        assert_eq!(text(&engine.read_row("a").unwrap().unwrap()), "2");
        engine.delete_row("a").unwrap();
        // a tombstoned row upserts as a fresh insert
        assert!(engine.upsert_row("a", element("3")).unwrap());
    }

    #[test]
    fn update_matching_counts_changes() {
        let fx = Fixture::new();
        let engine = fx.engine();
        for (id, color) in [("a", "red"), ("b", "red"), ("c", "blue")] {
            let mut el = Element::new("item");
            let mut child = Element::new("color");
            xml::set_text(&mut child, color);
            el.children.push(xmltree::XMLNode::Element(child));
            engine.insert_row(id, el).unwrap();
        }

        let matcher = ChildEquals::new("color", "red");
        let update = SetChildText::new("color", "green");
        assert_eq!(engine.update_matching(&matcher, &update).unwrap(), 2);
        // nothing red remains
        assert_eq!(engine.update_matching(&matcher, &update).unwrap(), 0);
    }

    #[test]
    fn delete_matching_and_query() {
        let fx = Fixture::new();
        let engine = fx.engine();
        for id in ["a", "b", "c"] {
            engine.insert_row(id, element(id)).unwrap();
        }
        let all: Vec<Element> = engine
            .query(Arc::new(MatchAll))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(all.len(), 3);

        assert_eq!(engine.delete_matching(&MatchAll).unwrap(), 3);
        let remaining = engine
            .query(Arc::new(MatchAll))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn snapshot_transactions_do_not_see_later_commits() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let txns = Arc::clone(&fx.txns);

        // T1 on a worker thread: insert "b", wait, commit, wait, exit
        let (to_t1, t1_steps) = mpsc::channel::<&str>();
        let (t1_done, from_t1) = mpsc::channel::<()>();
        let t1_engine = Arc::clone(&engine);
        let t1_txns = Arc::clone(&txns);
        let t1 = std::thread::spawn(move || {
            let scope = t1_txns
                .open_transaction(TransactionOptions::snapshot())
                .unwrap();
            t1_engine.insert_row("b", element("1")).unwrap();
            t1_done.send(()).unwrap();
            assert_eq!(t1_steps.recv().unwrap(), "commit");
            scope.commit().unwrap();
            t1_done.send(()).unwrap();
        });

        from_t1.recv().unwrap(); // T1 inserted, uncommitted

        // T2 starts after T1 but before T1 commits
        let scope2 = txns.open_transaction(TransactionOptions::snapshot()).unwrap();
        assert!(engine.read_row("b").unwrap().is_none());

        to_t1.send("commit").unwrap();
        from_t1.recv().unwrap(); // T1 committed
        t1.join().unwrap();

        // T2's snapshot predates the commit
        assert!(engine.read_row("b").unwrap().is_none());
        scope2.commit().unwrap();

        // outside any transaction the row is visible
        assert_eq!(text(&engine.read_row("b").unwrap().unwrap()), "1");
    }

    #[test]
    fn concurrent_commit_conflicts_under_snapshot() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let txns = Arc::clone(&fx.txns);

        engine.insert_row("c", element("1")).unwrap();

        let scope1 = txns.open_transaction(TransactionOptions::snapshot()).unwrap();
        assert!(engine.update_row("c", &SetChildText::new("v", "2")).unwrap());

        // T2 on another thread updates the same row and commits first
        let t2_engine = Arc::clone(&engine);
        let t2_txns = Arc::clone(&txns);
        std::thread::spawn(move || {
            let scope = t2_txns
                .open_transaction(TransactionOptions::snapshot())
                .unwrap();
            assert!(t2_engine.update_row("c", &SetChildText::new("v", "3")).unwrap());
            scope.commit().unwrap();
        })
        .join()
        .unwrap();

        assert!(matches!(scope1.commit(), Err(XFlatError::WriteConflict(_))));

        // the conflicting transaction was reverted; T2's value stands
        let row = engine.read_row("c").unwrap().unwrap();
        assert_eq!(text(xml::child_by_name(&row, "v").unwrap()), "3");
    }

    #[test]
    fn read_your_own_writes_inside_transaction() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let scope = fx
            .txns
            .open_transaction(TransactionOptions::snapshot())
            .unwrap();
        engine.insert_row("mine", element("1")).unwrap();
        assert_eq!(text(&engine.read_row("mine").unwrap().unwrap()), "1");
        engine.replace_row("mine", element("2")).unwrap();
        assert_eq!(text(&engine.read_row("mine").unwrap().unwrap()), "2");
        scope.commit().unwrap();
    }

    #[test]
    fn uncommitted_versions_never_reach_disk() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("kept", element("1")).unwrap();

        let scope = fx
            .txns
            .open_transaction(TransactionOptions::default())
            .unwrap();
        engine.insert_row("pending", element("2")).unwrap();
        engine
            .replace_row("kept", element("overwritten"))
            .unwrap();

        engine.dump_cache_now().unwrap();
        let doc = xml::read_document(&fx.file).unwrap();
        let rows = xml::parse_table_document(&doc);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "kept");
        for (_, versions) in &rows {
            for v in versions {
                assert!(v.is_committed());
            }
        }
        drop(scope);
    }

    #[test]
    fn spin_down_and_up_round_trips_committed_rows() {
        let fx = Fixture::new();
        let engine = fx.engine();
        for i in 0..10 {
            engine.insert_row(&i.to_string(), element(&i.to_string())).unwrap();
        }
        // an uncommitted insert right before spin-down must not survive
        let scope = fx
            .txns
            .open_transaction(TransactionOptions::default())
            .unwrap();
        engine.insert_row("uncommitted", element("x")).unwrap();

        engine.spin_down().unwrap();
        assert_eq!(engine.state(), EngineState::SpunDown);
        // idempotent
        engine.spin_down().unwrap();
        drop(scope);

        let engine2 = CachedDocumentEngine::new(
            "table",
            fx.file.clone(),
            test_config(),
            Arc::clone(&fx.txns),
            Arc::clone(&fx.pool),
        );
        assert!(engine2.spin_up().unwrap());
        engine2.begin_operations().unwrap();

        for i in 0..10 {
            assert_eq!(
                text(&engine2.read_row(&i.to_string()).unwrap().unwrap()),
                i.to_string()
            );
        }
        assert!(engine2.read_row("uncommitted").unwrap().is_none());
    }

    #[test]
    fn spun_down_engine_rejects_operations() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("a", element("1")).unwrap();
        engine.spin_down().unwrap();
        assert!(matches!(
            engine.read_row("a"),
            Err(XFlatError::EngineState(_))
        ));
        assert!(matches!(
            engine.insert_row("b", element("2")),
            Err(XFlatError::EngineState(_))
        ));
    }

    #[test]
    fn tenth_maintenance_pass_drops_tombstoned_rows() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("a", element("1")).unwrap();
        engine.insert_row("d", element("2")).unwrap();
        engine.delete_row("d").unwrap();

        // sweeps over the uncommitted set do not visit the quiet row
        for _ in 0..9 {
            engine.maintenance_pass().unwrap();
            assert_eq!(engine.stats().cached_rows, 2);
        }
        // the tenth pass walks the whole cache and drops it
        engine.maintenance_pass().unwrap();
        assert_eq!(engine.stats().cached_rows, 1);
        assert_eq!(engine.stats().rows_dropped, 1);

        engine.dump_cache_now().unwrap();
        let doc = xml::read_document(&fx.file).unwrap();
        let rows = xml::parse_table_document(&doc);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "a");
    }

    #[test]
    fn maintenance_keeps_rows_referenced_by_open_transactions() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("d", element("1")).unwrap();

        // reader snapshot taken between the insert and the delete
        let scope = fx
            .txns
            .open_transaction(TransactionOptions::snapshot())
            .unwrap();
        {
            // transactionless delete from another thread
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.delete_row("d").unwrap())
                .join()
                .unwrap();
        }

        // full sweeps must keep the pre-delete version the reader observes
        for _ in 0..10 {
            engine.maintenance_pass().unwrap();
        }
        assert_eq!(engine.stats().cached_rows, 1);
        assert_eq!(text(&engine.read_row("d").unwrap().unwrap()), "1");

        // once the reader resolves, the next full sweep drops the row
        scope.commit().unwrap();
        for _ in 0..10 {
            engine.maintenance_pass().unwrap();
        }
        assert_eq!(engine.stats().cached_rows, 0);
    }

    #[test]
    fn deferred_dumps_coalesce() {
        let fx = Fixture::new();
        let engine = fx.engine();
        for i in 0..20 {
            engine.insert_row(&i.to_string(), element("v")).unwrap();
        }
        // give the deferred dump time to run
        std::thread::sleep(Duration::from_millis(80));
        let stats = engine.stats();
        assert!(stats.dumps >= 1);
        assert!(
            stats.dumps < 20,
            "expected coalescing, saw {} dumps",
            stats.dumps
        );
        let doc = xml::read_document(&fx.file).unwrap();
        assert_eq!(xml::parse_table_document(&doc).len(), 20);
    }

    #[test]
    fn query_cursor_blocks_spin_down_until_closed() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("a", element("1")).unwrap();

        let mut cursor = engine.query(Arc::new(MatchAll)).unwrap();

        let spin = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.spin_down())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.state(), EngineState::SpinningDown);

        assert!(cursor.next().is_some());
        drop(cursor);

        spin.join().unwrap().unwrap();
        assert_eq!(engine.state(), EngineState::SpunDown);
    }

    #[test]
    fn durable_commit_writes_synchronously() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let scope = fx
            .txns
            .open_transaction(TransactionOptions::default().with_durable(true))
            .unwrap();
        engine.insert_row("a", element("1")).unwrap();
        scope.commit().unwrap();

        let doc = xml::read_document(&fx.file).unwrap();
        let rows = xml::parse_table_document(&doc);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].1[0].is_committed());
    }

    #[test]
    fn corrupt_file_aborts_spin_up() {
        let fx = Fixture::new();
        std::fs::write(&fx.file, "<table name='t'><row id=").unwrap();
        let engine = CachedDocumentEngine::new(
            "table",
            fx.file.clone(),
            test_config(),
            Arc::clone(&fx.txns),
            Arc::clone(&fx.pool),
        );
        assert!(engine.spin_up().is_err());
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn random_replay_survives_spin_down_and_up() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

        let fx = Fixture::new();
        let engine = fx.engine();
        let mut expected: std::collections::BTreeMap<String, String> =
            std::collections::BTreeMap::new();

        for _ in 0..200 {
            let id = rng.gen_range(0..20).to_string();
            if rng.gen_bool(0.3) {
                match engine.delete_row(&id) {
                    Ok(()) => {
                        expected.remove(&id);
                    }
                    Err(XFlatError::KeyNotFound(_)) => {}
                    Err(err) => panic!("unexpected delete failure: {err}"),
                }
            } else {
                let value = rng.gen_range(0..1000).to_string();
                engine.upsert_row(&id, element(&value)).unwrap();
                expected.insert(id, value);
            }
        }

        engine.spin_down().unwrap();

        let engine2 = CachedDocumentEngine::new(
            "table",
            fx.file.clone(),
            test_config(),
            Arc::clone(&fx.txns),
            Arc::clone(&fx.pool),
        );
        assert!(engine2.spin_up().unwrap());
        engine2.begin_operations().unwrap();

        for (id, value) in &expected {
            assert_eq!(
                text(&engine2.read_row(id).unwrap().unwrap()),
                *value,
                "row {id} diverged after reload"
            );
        }
        let visible = engine2
            .query(Arc::new(MatchAll))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(visible.len(), expected.len());
    }

    #[test]
    fn recovery_reverts_transactions_without_a_commit_record() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("table.xml");
        let journal = dir.path().join("txn.journal");
        let pool = TaskPool::new(2);

        // a transaction assigns commit ids on the engine and the versions
        // reach disk, but the manager dies before recording the commit
        let tx_id = {
            let txns = TransactionManager::with_journal(journal.clone()).unwrap();
            let engine = CachedDocumentEngine::new(
                "table",
                file.clone(),
                test_config(),
                Arc::clone(&txns),
                Arc::clone(&pool),
            );
            assert!(engine.spin_up().unwrap());
            engine.begin_operations().unwrap();
            engine.insert_row("durable", element("keep")).unwrap();

            let scope = txns.open_transaction(TransactionOptions::default()).unwrap();
            engine.insert_row("halfway", element("lost")).unwrap();
            let tx = Arc::clone(scope.transaction());
            tx.set_commit_id(txns.transactionless_commit_id());
            engine.commit(&tx).unwrap();
            engine.dump_cache_now().unwrap();

            // crash: the scope never resolves and nothing is journaled
            std::mem::forget(scope);
            tx.id()
        };

        // restart: the half-committed row is on disk
        let txns = TransactionManager::with_journal(journal).unwrap();
        let engine = CachedDocumentEngine::new(
            "table",
            file.clone(),
            test_config(),
            Arc::clone(&txns),
            Arc::clone(&pool),
        );
        assert!(engine.spin_up().unwrap());
        engine.begin_operations().unwrap();
        assert!(engine.read_row("halfway").unwrap().is_some());

        let engines: Vec<Arc<dyn Engine>> = vec![Arc::clone(&engine) as Arc<dyn Engine>];
        txns.recover(&engines).unwrap();
        assert!(txns.is_transaction_reverted(tx_id));

        assert!(engine.read_row("halfway").unwrap().is_none());
        assert_eq!(text(&engine.read_row("durable").unwrap().unwrap()), "keep");

        // the reverted version is gone from disk as well
        let doc = xml::read_document(&file).unwrap();
        let rows = xml::parse_table_document(&doc);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "durable");
    }

    #[test]
    fn force_spin_down_short_circuits() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("a", element("1")).unwrap();
        engine.force_spin_down().unwrap();
        assert_eq!(engine.state(), EngineState::SpunDown);
        assert!(matches!(
            engine.read_row("a"),
            Err(XFlatError::EngineState(_))
        ));
        // still idempotent through the graceful path
        engine.spin_down().unwrap();
    }
}
