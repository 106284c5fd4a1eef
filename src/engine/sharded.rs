//! Id-sharded engine
//!
//! Partitions one logical table into many cached engines keyed by
//! half-open intervals over the row id. Each shard is a full table of its
//! own — metadata, engine lifecycle, durable `<interval>.xml` file — living
//! in the table's shard directory. Children are created lazily on first
//! touch and retired in the background once idle.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use xmltree::Element;

use crate::config::TableConfig;
use crate::engine::interval::{Interval, IntervalProvider};
use crate::engine::{Engine, EngineState, RowCursor, StateCell};
use crate::error::{Result, XFlatError};
use crate::metadata::TableMetadata;
use crate::query::{RowMatcher, RowUpdate, ShardSelector};
use crate::scheduler::{CancellationToken, TaskPool};
use crate::txn::{Transaction, TransactionId};

/// Cadence of the parent's drain monitor while spinning down.
const SPIN_DOWN_MONITOR_INTERVAL: Duration = Duration::from_millis(10);

/// How rows are routed to shards.
#[derive(Clone)]
pub struct ShardConfig {
    pub selector: Arc<dyn ShardSelector>,
    pub provider: Arc<dyn IntervalProvider>,
}

/// Capability for creating and persisting shard metadata, implemented by
/// the table-metadata factory. Passing it in here keeps ownership a single
/// line: factory → metadata → engine.
pub trait ShardMetadataFactory: Send + Sync {
    /// Create (or reload) the metadata for one shard of `parent`, whose
    /// durable file lives at `file`.
    fn shard_metadata(
        &self,
        parent: &str,
        shard_name: &str,
        file: PathBuf,
        config: TableConfig,
    ) -> Result<Arc<TableMetadata>>;

    /// Persist a shard's metadata after retirement.
    fn persist(&self, metadata: &TableMetadata) -> Result<()>;
}

/// Point-in-time shard bookkeeping counts.
#[derive(Debug, Clone)]
pub struct ShardStats {
    pub open_shards: usize,
    pub known_shards: usize,
    pub draining_shards: usize,
}

pub struct IdShardedEngine {
    name: String,
    directory: PathBuf,
    config: TableConfig,
    shards: ShardConfig,
    factory: Arc<dyn ShardMetadataFactory>,
    pool: Arc<TaskPool>,
    state: StateCell,
    /// Currently active children.
    open_shards: DashMap<Interval, Arc<TableMetadata>>,
    /// Every shard discovered on disk, loaded or not.
    known_shards: DashMap<Interval, PathBuf>,
    /// Linearises child creation against parent shutdown.
    spin_down_root: Mutex<()>,
    /// Children being drained during parent spin-down.
    spinning_down: DashMap<Interval, Arc<dyn Engine>>,
    retire_token: Mutex<Option<CancellationToken>>,
    monitor_token: Mutex<Option<CancellationToken>>,
    on_spin_down: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    weak_self: Weak<IdShardedEngine>,
}

impl IdShardedEngine {
    pub fn new(
        name: impl Into<String>,
        directory: PathBuf,
        config: TableConfig,
        shards: ShardConfig,
        factory: Arc<dyn ShardMetadataFactory>,
        pool: Arc<TaskPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.into(),
            directory,
            config,
            shards,
            factory,
            pool,
            state: StateCell::new(),
            open_shards: DashMap::new(),
            known_shards: DashMap::new(),
            spin_down_root: Mutex::new(()),
            spinning_down: DashMap::new(),
            retire_token: Mutex::new(None),
            monitor_token: Mutex::new(None),
            on_spin_down: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            open_shards: self.open_shards.len(),
            known_shards: self.known_shards.len(),
            draining_shards: self.spinning_down.len(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        self.state.await_running(&self.name)
    }

    /// Evaluate the shard selector and map the value to its interval.
    fn route(&self, row_id: &str, element: Option<&Element>) -> Result<Interval> {
        let expression = self.shards.selector.expression();
        let raw = self
            .shards
            .selector
            .select(row_id, element)
            .ok_or_else(|| {
                XFlatError::Sharding(format!(
                    "shard selector {expression} produced no value for row {row_id:?}"
                ))
            })?;
        let value = self.shards.provider.convert(&raw).map_err(|err| {
            XFlatError::Sharding(format!("shard selector {expression}: {err}"))
        })?;
        Ok(self.shards.provider.interval_for(value))
    }

    /// Resolve the metadata for a shard, creating it lazily. Creation is
    /// serialised against parent shutdown; a child created while the parent
    /// is spinning down joins the drain set so it is not orphaned.
    fn shard_metadata(&self, interval: Interval) -> Result<Arc<TableMetadata>> {
        if let Some(meta) = self.open_shards.get(&interval) {
            return Ok(Arc::clone(meta.value()));
        }

        let _guard = self.spin_down_root.lock();
        if self.state.get() == EngineState::SpunDown {
            return Err(XFlatError::EngineState(format!(
                "sharded engine {} is spun down",
                self.name
            )));
        }
        if let Some(meta) = self.open_shards.get(&interval) {
            return Ok(Arc::clone(meta.value()));
        }

        let shard_name = self.shards.provider.name(&interval);
        let file = self.directory.join(format!("{shard_name}.xml"));
        let meta = self.factory.shard_metadata(
            &self.name,
            &shard_name,
            file.clone(),
            self.config.shard_child(),
        )?;
        tracing::debug!(table = %self.name, shard = %shard_name, "opened shard");
        self.open_shards.insert(interval, Arc::clone(&meta));
        self.known_shards.insert(interval, file);

        if self.state.get() == EngineState::SpinningDown {
            let engine = meta.provide_engine()?;
            self.spinning_down.insert(interval, engine);
        }
        Ok(meta)
    }

    fn engine_for(&self, interval: Interval) -> Result<Arc<dyn Engine>> {
        self.shard_metadata(interval)?.provide_engine()
    }

    /// Run `op` against the child for `interval`. A child that spun down
    /// between lookup and call raises an engine-state error; the operation
    /// is retried exactly once against a freshly resolved child.
    fn with_shard<R>(
        &self,
        interval: Interval,
        op: impl Fn(&dyn Engine) -> Result<R>,
    ) -> Result<R> {
        let engine = self.engine_for(interval)?;
        match op(engine.as_ref()) {
            Err(err) if err.is_engine_state() => {
                tracing::debug!(table = %self.name, %interval, "child engine went away, retrying once");
                let engine = self.engine_for(interval)?;
                op(engine.as_ref())
            }
            result => result,
        }
    }

    /// Every interval with a shard on disk or in memory, in interval order.
    fn all_intervals(&self) -> Vec<Interval> {
        let mut intervals: std::collections::BTreeSet<Interval> = self
            .known_shards
            .iter()
            .map(|e| *e.key())
            .collect();
        intervals.extend(self.open_shards.iter().map(|e| *e.key()));
        intervals.into_iter().collect()
    }

    /// Retire idle children: spin each down and persist its metadata.
    fn retire_idle_shards(&self) {
        if self.state.get() >= EngineState::SpinningDown {
            return;
        }
        let candidates: Vec<(Interval, Arc<TableMetadata>)> = self
            .open_shards
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        for (interval, meta) in candidates {
            if !meta.can_spin_down() {
                continue;
            }
            let _guard = self.spin_down_root.lock();
            if self.state.get() >= EngineState::SpinningDown {
                return;
            }
            if !meta.can_spin_down() {
                continue;
            }
            self.open_shards.remove(&interval);
            match meta.spin_down(false) {
                Ok(None) => {
                    if let Err(err) = self.factory.persist(&meta) {
                        tracing::warn!(table = %self.name, %interval, error = %err, "persisting shard metadata failed");
                    }
                    tracing::debug!(table = %self.name, %interval, "retired idle shard");
                }
                // the shard picked up uncommitted work in the meantime
                Ok(Some(_)) => {
                    self.open_shards.insert(interval, meta);
                }
                Err(err) => {
                    tracing::warn!(table = %self.name, %interval, error = %err, "shard spin-down failed");
                    self.open_shards.insert(interval, meta);
                }
            }
        }
    }

    /// Drain monitor run while the parent spins down.
    fn monitor_drain(&self, token: &CancellationToken) {
        let _guard = self.spin_down_root.lock();
        let draining: Vec<(Interval, Arc<dyn Engine>)> = self
            .spinning_down
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        for (interval, engine) in draining {
            match engine.state() {
                EngineState::SpunDown | EngineState::Uninitialized => {
                    self.spinning_down.remove(&interval);
                }
                // slipped back to running (late creation); ask again
                EngineState::Running => {
                    let _ = engine.spin_down();
                }
                _ => {}
            }
        }

        if self.spinning_down.is_empty() {
            token.cancel();
            if self
                .state
                .transition(EngineState::SpinningDown, EngineState::SpunDown)
            {
                tracing::info!(table = %self.name, "sharded engine spun down");
                if let Some(listener) = self.on_spin_down.lock().take() {
                    listener();
                }
            }
        }
    }

    /// Callback fired once when the engine reaches `SpunDown`.
    pub fn set_spin_down_listener(&self, listener: impl FnOnce() + Send + 'static) {
        *self.on_spin_down.lock() = Some(Box::new(listener));
    }
}

impl Engine for IdShardedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EngineState {
        self.state.get()
    }

    fn insert_row(&self, id: &str, element: Element) -> Result<()> {
        self.ensure_running()?;
        let interval = self.route(id, Some(&element))?;
        self.with_shard(interval, |engine| engine.insert_row(id, element.clone()))
    }

    fn read_row(&self, id: &str) -> Result<Option<Element>> {
        self.ensure_running()?;
        let interval = self.route(id, None)?;
        self.with_shard(interval, |engine| engine.read_row(id))
    }

    fn replace_row(&self, id: &str, element: Element) -> Result<()> {
        self.ensure_running()?;
        let interval = self.route(id, None)?;
        self.with_shard(interval, |engine| engine.replace_row(id, element.clone()))
    }

    fn update_row(&self, id: &str, update: &dyn RowUpdate) -> Result<bool> {
        self.ensure_running()?;
        let interval = self.route(id, None)?;
        self.with_shard(interval, |engine| engine.update_row(id, update))
    }

    fn update_matching(&self, matcher: &dyn RowMatcher, update: &dyn RowUpdate) -> Result<usize> {
        self.ensure_running()?;
        let mut changed = 0;
        for interval in self.all_intervals() {
            changed += self.with_shard(interval, |engine| engine.update_matching(matcher, update))?;
        }
        Ok(changed)
    }

    fn upsert_row(&self, id: &str, element: Element) -> Result<bool> {
        self.ensure_running()?;
        let interval = self.route(id, Some(&element))?;
        self.with_shard(interval, |engine| engine.upsert_row(id, element.clone()))
    }

    fn delete_row(&self, id: &str) -> Result<()> {
        self.ensure_running()?;
        let interval = self.route(id, None)?;
        self.with_shard(interval, |engine| engine.delete_row(id))
    }

    fn delete_matching(&self, matcher: &dyn RowMatcher) -> Result<usize> {
        self.ensure_running()?;
        let mut deleted = 0;
        for interval in self.all_intervals() {
            deleted += self.with_shard(interval, |engine| engine.delete_matching(matcher))?;
        }
        Ok(deleted)
    }

    fn query(&self, matcher: Arc<dyn RowMatcher>) -> Result<RowCursor> {
        self.ensure_running()?;
        let intervals = self.all_intervals();
        let weak = self.weak_self.clone();
        let mut current: Option<RowCursor> = None;
        let mut index = 0;

        let iter = std::iter::from_fn(move || loop {
            if let Some(cursor) = current.as_mut() {
                match cursor.next() {
                    Some(item) => return Some(item),
                    None => current = None,
                }
                continue;
            }
            if index >= intervals.len() {
                return None;
            }
            let interval = intervals[index];
            index += 1;

            let Some(parent) = weak.upgrade() else {
                return Some(Err(XFlatError::EngineState("engine dropped".into())));
            };
            match parent
                .engine_for(interval)
                .and_then(|engine| engine.query(Arc::clone(&matcher)))
            {
                Ok(cursor) => current = Some(cursor),
                Err(err) => return Some(Err(err)),
            }
        });
        Ok(RowCursor::new(Box::new(iter)))
    }

    fn commit(&self, tx: &Transaction) -> Result<()> {
        // children a transaction wrote to are bound to it directly; this
        // path only matters for callers driving the parent by hand
        for entry in self.open_shards.iter() {
            if let Some(engine) = entry.value().engine_if_loaded() {
                if engine.has_uncommitted_data() {
                    engine.commit(tx)?;
                }
            }
        }
        Ok(())
    }

    fn revert(&self, tx_id: TransactionId, recovering: bool) -> Result<()> {
        if recovering {
            // scrub every shard on disk, resolving engines as needed
            for interval in self.all_intervals() {
                self.with_shard(interval, |engine| engine.revert(tx_id, true))?;
            }
            return Ok(());
        }
        for entry in self.open_shards.iter() {
            if let Some(engine) = entry.value().engine_if_loaded() {
                engine.revert(tx_id, false)?;
            }
        }
        Ok(())
    }

    fn spin_up(&self) -> Result<bool> {
        std::fs::create_dir_all(&self.directory)?;
        if !self
            .state
            .transition(EngineState::Uninitialized, EngineState::SpinningUp)
        {
            return Ok(false);
        }
        tracing::info!(table = %self.name, directory = %self.directory.display(), "spinning up sharded engine");

        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.shards.provider.parse_name(stem) {
                Some(interval) => {
                    self.known_shards.insert(interval, path);
                }
                None => {
                    tracing::warn!(table = %self.name, file = %path.display(), "ignoring file with unrecognised shard name");
                }
            }
        }

        self.state
            .transition(EngineState::SpinningUp, EngineState::SpunUp);
        Ok(true)
    }

    fn begin_operations(&self) -> Result<()> {
        {
            let mut slot = self.retire_token.lock();
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
                        engine.retire_idle_shards();
                    },
                );
            }
        }

        if !self
            .state
            .transition(EngineState::SpunUp, EngineState::Running)
        {
            return Err(XFlatError::EngineState(format!(
                "engine {} cannot begin operations from state {}",
                self.name,
                self.state.get()
            )));
        }
        Ok(())
    }

    fn spin_down(&self) -> Result<()> {
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
        tracing::info!(table = %self.name, "spinning down sharded engine");
        if let Some(token) = self.retire_token.lock().take() {
            token.cancel();
        }

        {
            let _guard = self.spin_down_root.lock();
            let children: Vec<(Interval, Arc<TableMetadata>)> = self
                .open_shards
                .iter()
                .map(|e| (*e.key(), Arc::clone(e.value())))
                .collect();
            for (interval, meta) in children {
                self.open_shards.remove(&interval);
                if let Some(engine) = meta.engine_if_loaded() {
                    self.spinning_down.insert(interval, engine);
                }
                match meta.spin_down(false) {
                    Ok(None) => {
                        if let Err(err) = self.factory.persist(&meta) {
                            tracing::warn!(table = %self.name, %interval, error = %err, "persisting shard metadata failed");
                        }
                    }
                    // still carrying uncommitted data; the monitor keeps
                    // re-requesting until it drains
                    Ok(Some(_)) => {}
                    Err(err) => {
                        tracing::warn!(table = %self.name, %interval, error = %err, "shard spin-down failed");
                    }
                }
            }
        }

        let token = CancellationToken::new();
        *self.monitor_token.lock() = Some(token.clone());
        let weak = self.weak_self.clone();
        let task_token = token.clone();
        self.pool
            .schedule_periodic(SPIN_DOWN_MONITOR_INTERVAL, token, move || {
                match weak.upgrade() {
                    Some(engine) => engine.monitor_drain(&task_token),
                    None => task_token.cancel(),
                }
            });
        Ok(())
    }

    fn force_spin_down(&self) -> Result<()> {
        if let Some(token) = self.retire_token.lock().take() {
            token.cancel();
        }
        if let Some(token) = self.monitor_token.lock().take() {
            token.cancel();
        }
        self.state.force(EngineState::SpunDown);

        let children: Vec<Arc<TableMetadata>> = self
            .open_shards
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.open_shards.clear();
        for meta in children {
            if let Some(engine) = meta.engine_if_loaded() {
                let _ = engine.force_spin_down();
            }
        }
        let draining: Vec<Arc<dyn Engine>> = self
            .spinning_down
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.spinning_down.clear();
        for engine in draining {
            let _ = engine.force_spin_down();
        }

        if let Some(listener) = self.on_spin_down.lock().take() {
            listener();
        }
        Ok(())
    }

    fn has_uncommitted_data(&self) -> bool {
        self.open_shards.iter().any(|entry| {
            entry
                .value()
                .engine_if_loaded()
                .map(|engine| engine.has_uncommitted_data())
                .unwrap_or(false)
        })
    }

    fn save_metadata(&self, _element: &mut Element) {
        // shard state lives with the children; the parent keeps nothing
    }

    fn load_metadata(&self, _element: &Element) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TableMetadataFactory;
    use crate::query::MatchAll;
    use crate::txn::TransactionManager;
    use crate::xml;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn element(text: &str) -> Element {
        let mut el = Element::new("x");
        xml::set_text(&mut el, text);
        el
    }

    struct Fixture {
        dir: tempfile::TempDir,
        pool: Arc<TaskPool>,
        txns: Arc<TransactionManager>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                pool: TaskPool::new(2),
                txns: TransactionManager::new(),
            }
        }

        fn sharded_config(&self) -> TableConfig {
            TableConfig {
                dump_coalesce_ms: 10,
                maintenance_interval_ms: 3_600_000,
                ..TableConfig::sharded(100)
            }
        }

        fn engine_with_config(&self, config: TableConfig) -> Arc<IdShardedEngine> {
            let factory = TableMetadataFactory::new(
                self.dir.path().to_path_buf(),
                Arc::clone(&self.pool),
                Arc::clone(&self.txns),
            )
            .unwrap();
            let provider = crate::engine::interval::FixedWidthIntervalProvider::new(
                config.shard_width.unwrap(),
                config.shard_base,
            );
            let engine = IdShardedEngine::new(
                "t",
                self.dir.path().join("t"),
                config,
                ShardConfig {
                    selector: Arc::new(crate::query::RowIdSelector),
                    provider,
                },
                factory,
                Arc::clone(&self.pool),
            );
            assert!(engine.spin_up().unwrap());
            engine.begin_operations().unwrap();
            engine
        }

        fn engine(&self) -> Arc<IdShardedEngine> {
            self.engine_with_config(self.sharded_config())
        }
    }

    fn wait_for_state(engine: &IdShardedEngine, state: EngineState) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while engine.state() != state {
            assert!(
                std::time::Instant::now() < deadline,
                "engine never reached {state}, still {}",
                engine.state()
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn values_create_interval_named_shard_files() {
        let fx = Fixture::new();
        let engine = fx.engine();

        engine.insert_row("5", element("a")).unwrap();
        engine.insert_row("105", element("b")).unwrap();
        engine.insert_row("-95", element("c")).unwrap();

        let shard_dir = fx.dir.path().join("t");
        assert!(shard_dir.join("0.xml").exists());
        assert!(shard_dir.join("100.xml").exists());
        assert!(shard_dir.join("-100.xml").exists());

        // a read materialises the shard it routes to
        assert!(engine.read_row("205").unwrap().is_none());
        assert!(shard_dir.join("200.xml").exists());
        assert_eq!(engine.stats().open_shards, 4);
    }

    #[test]
    fn keyed_operations_route_to_the_right_shard() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("5", element("five")).unwrap();
        engine.insert_row("105", element("hundred-five")).unwrap();

        assert_eq!(
            xml::text_of(&engine.read_row("5").unwrap().unwrap()),
            "five"
        );
        assert_eq!(
            xml::text_of(&engine.read_row("105").unwrap().unwrap()),
            "hundred-five"
        );
        engine.delete_row("5").unwrap();
        assert!(engine.read_row("5").unwrap().is_none());
        assert!(engine.read_row("105").unwrap().is_some());
    }

    #[test]
    fn non_convertible_ids_are_routing_failures() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let err = engine.insert_row("not-a-number", element("x")).unwrap_err();
        match err {
            XFlatError::Sharding(message) => {
                assert!(message.contains("@xflat:id"), "{message}");
            }
            other => panic!("expected a sharding error, got {other}"),
        }
    }

    #[test]
    fn queries_fan_out_across_all_shards() {
        let fx = Fixture::new();
        let engine = fx.engine();
        for id in ["5", "105", "-95", "205"] {
            engine.insert_row(id, element(id)).unwrap();
        }
        let rows = engine
            .query(Arc::new(MatchAll))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(rows.len(), 4);

        assert_eq!(engine.delete_matching(&MatchAll).unwrap(), 4);
        assert!(engine
            .query(Arc::new(MatchAll))
            .unwrap()
            .collect_rows()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn known_shards_are_rediscovered_after_restart() {
        let fx = Fixture::new();
        {
            let engine = fx.engine();
            engine.insert_row("5", element("five")).unwrap();
            engine.insert_row("105", element("hundred-five")).unwrap();
            engine.spin_down().unwrap();
            wait_for_state(&engine, EngineState::SpunDown);
        }

        let engine = fx.engine();
        assert_eq!(engine.stats().known_shards, 2);
        assert_eq!(engine.stats().open_shards, 0);
        // lazily reloaded on first query
        let rows = engine
            .query(Arc::new(MatchAll))
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn idle_shards_retire_in_the_background() {
        let fx = Fixture::new();
        let engine = fx.engine_with_config(TableConfig {
            inactivity_shutdown_ms: 30,
            maintenance_interval_ms: 20,
            dump_coalesce_ms: 10,
            ..TableConfig::sharded(100)
        });

        engine.insert_row("5", element("five")).unwrap();
        assert_eq!(engine.stats().open_shards, 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while engine.stats().open_shards > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "shard was never retired"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.stats().known_shards, 1);

        // retirement persisted the shard; the row comes back on demand
        assert_eq!(
            xml::text_of(&engine.read_row("5").unwrap().unwrap()),
            "five"
        );
        assert_eq!(engine.stats().open_shards, 1);
    }

    #[test]
    fn parent_spin_down_drains_children() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("5", element("a")).unwrap();
        engine.insert_row("105", element("b")).unwrap();

        engine.spin_down().unwrap();
        wait_for_state(&engine, EngineState::SpunDown);
        assert_eq!(engine.stats().draining_shards, 0);

        // idempotent, and operations are refused afterwards
        engine.spin_down().unwrap();
        assert!(matches!(
            engine.read_row("5"),
            Err(XFlatError::EngineState(_))
        ));

        // the shard files survived the shutdown
        let doc = xml::read_document(&fx.dir.path().join("t").join("0.xml")).unwrap();
        assert_eq!(xml::parse_table_document(&doc).len(), 1);
    }

    #[test]
    fn force_spin_down_short_circuits() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("5", element("a")).unwrap();
        engine.force_spin_down().unwrap();
        assert_eq!(engine.state(), EngineState::SpunDown);
        assert!(matches!(
            engine.insert_row("6", element("b")),
            Err(XFlatError::EngineState(_))
        ));
    }

    #[test]
    fn child_engine_state_errors_retry_once() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("5", element("five")).unwrap();
        let interval = engine.route("5", None).unwrap();

        let calls = AtomicUsize::new(0);
        let row = engine
            .with_shard(interval, |child| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(XFlatError::EngineState("stale child".into()))
                } else {
                    child.read_row("5")
                }
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(xml::text_of(&row.unwrap()), "five");

        // a second consecutive failure propagates
        let calls = AtomicUsize::new(0);
        let err = engine
            .with_shard(interval, |_child: &dyn Engine| -> Result<()> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(XFlatError::EngineState("still stale".into()))
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.is_engine_state());
    }

    #[test]
    fn shard_reopens_after_child_retirement() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine.insert_row("5", element("five")).unwrap();

        // retire the only shard by hand
        let meta = {
            let entry = engine.open_shards.iter().next().unwrap();
            Arc::clone(entry.value())
        };
        let interval = *engine.open_shards.iter().next().unwrap().key();
        engine.open_shards.remove(&interval);
        meta.spin_down(false).unwrap();

        // the next keyed operation resolves a fresh child
        assert_eq!(
            xml::text_of(&engine.read_row("5").unwrap().unwrap()),
            "five"
        );
    }
}
