//! Table metadata
//!
//! One [`TableMetadata`] per logical table owns the engine cell: it spins
//! an engine up on demand, tracks activity so idle engines can be retired,
//! and persists the per-table metadata document — the table config as JSON,
//! the id-generator state and the engine's own metadata element — so every
//! later spin-up starts from the saved state.
//!
//! ```text
//! <metadata name="people">
//!   <config>{ json }</config>
//!   <generator xflat:maxId="7"/>
//!   <engine/>
//! </metadata>
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use xmltree::{Element, XMLNode};

use crate::config::{IdGeneratorKind, TableConfig};
use crate::engine::cached::CachedDocumentEngine;
use crate::engine::interval::FixedWidthIntervalProvider;
use crate::engine::sharded::{IdShardedEngine, ShardConfig, ShardMetadataFactory};
use crate::engine::{Engine, EngineState};
use crate::error::{Result, XFlatError};
use crate::idgen::{IdGenerator, IntegerIdGenerator, UuidIdGenerator};
use crate::query::RowIdSelector;
use crate::scheduler::TaskPool;
use crate::txn::TransactionManager;
use crate::xml;

/// How long a losing racer spins for the winning engine to come up before
/// retrying from the top.
const ENGINE_RACE_SPIN: Duration = Duration::from_nanos(250);

const METADATA_TAG: &str = "metadata";
const CONFIG_TAG: &str = "config";
const GENERATOR_TAG: &str = "generator";
const ENGINE_TAG: &str = "engine";
const NAME_ATTR: &str = "name";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Metadata and engine cell for one table (or one shard of one table).
pub struct TableMetadata {
    name: String,
    /// The engine's durable location: an XML file for cached engines, a
    /// shard directory for sharded ones.
    file: PathBuf,
    metadata_file: PathBuf,
    config: TableConfig,
    generator: Arc<dyn IdGenerator>,
    engine_element: Mutex<Element>,
    last_activity: AtomicI64,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    shard_factory: Arc<dyn ShardMetadataFactory>,
    txns: Arc<TransactionManager>,
    pool: Arc<TaskPool>,
}

impl TableMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn generator(&self) -> &Arc<dyn IdGenerator> {
        &self.generator
    }

    pub fn engine_if_loaded(&self) -> Option<Arc<dyn Engine>> {
        self.engine.lock().clone()
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Release);
    }

    /// A running engine for this table, spinning one up when the cell is
    /// empty or holds a spun-down engine. Losers of the install race spin
    /// briefly for the winner, then fall back to whatever is installed.
    pub fn provide_engine(&self) -> Result<Arc<dyn Engine>> {
        self.touch();
        loop {
            if let Some(engine) = self.engine.lock().clone() {
                if engine.state() != EngineState::SpunDown {
                    return Ok(engine);
                }
            }

            let fresh = self.create_engine()?;
            fresh.load_metadata(&self.engine_element.lock());

            let winner = {
                let mut cell = self.engine.lock();
                match cell.clone() {
                    Some(current) if current.state() != EngineState::SpunDown => Some(current),
                    _ => {
                        *cell = Some(Arc::clone(&fresh));
                        None
                    }
                }
            };

            if let Some(winner) = winner {
                // another thread installed first; give its engine a moment
                let start = Instant::now();
                while winner.state() != EngineState::Running
                    && start.elapsed() < ENGINE_RACE_SPIN
                {
                    std::hint::spin_loop();
                }
                if winner.state() != EngineState::SpunDown {
                    return Ok(winner);
                }
                continue;
            }

            // only the installer that performed the spin-up starts operations
            if fresh.spin_up()? {
                fresh.begin_operations()?;
            }
            return Ok(fresh);
        }
    }

    fn create_engine(&self) -> Result<Arc<dyn Engine>> {
        if let Some(width) = self.config.shard_width {
            let shards = ShardConfig {
                selector: Arc::new(RowIdSelector),
                provider: FixedWidthIntervalProvider::new(width, self.config.shard_base),
            };
            Ok(IdShardedEngine::new(
                self.name.clone(),
                self.file.clone(),
                self.config.clone(),
                shards,
                Arc::clone(&self.shard_factory),
                Arc::clone(&self.pool),
            ))
        } else {
            Ok(CachedDocumentEngine::new(
                self.name.clone(),
                self.file.clone(),
                self.config.clone(),
                Arc::clone(&self.txns),
                Arc::clone(&self.pool),
            ))
        }
    }

    /// Spin the engine down and persist the metadata document.
    ///
    /// Without `force`, an engine holding uncommitted data is left running
    /// and returned unchanged. A graceful spin-down that the engine rejects
    /// falls back to the forced path.
    pub fn spin_down(&self, force: bool) -> Result<Option<Arc<dyn Engine>>> {
        let engine = {
            let mut cell = self.engine.lock();
            let Some(engine) = cell.clone() else {
                return Ok(None);
            };
            if !force && engine.has_uncommitted_data() {
                return Ok(Some(engine));
            }
            *cell = None;
            engine
        };

        {
            let mut element = self.engine_element.lock();
            engine.save_metadata(&mut element);
        }
        if let Err(err) = engine.spin_down() {
            tracing::warn!(table = %self.name, error = %err, "graceful spin-down rejected, forcing");
            engine.force_spin_down()?;
        }
        self.save_metadata()?;
        Ok(None)
    }

    /// True once the table has been idle past the inactivity threshold and
    /// no uncommitted data is at risk. An absent engine counts as having no
    /// uncommitted data; the threshold still applies.
    pub fn can_spin_down(&self) -> bool {
        let idle = now_millis().saturating_sub(self.last_activity.load(Ordering::Acquire));
        if idle < self.config.inactivity_shutdown_ms as i64 {
            return false;
        }
        self.engine
            .lock()
            .as_ref()
            .map_or(true, |engine| !engine.has_uncommitted_data())
    }

    /// Write the metadata document for this table.
    pub fn save_metadata(&self) -> Result<()> {
        let mut root = Element::new(METADATA_TAG);
        root.attributes
            .insert(NAME_ATTR.to_string(), self.name.clone());
        root.namespaces = Some(xml::xflat_namespace());

        let mut config_el = Element::new(CONFIG_TAG);
        xml::set_text(&mut config_el, &serde_json::to_string(&self.config)?);
        root.children.push(XMLNode::Element(config_el));

        let mut generator_el = Element::new(GENERATOR_TAG);
        self.generator.save_state(&mut generator_el);
        root.children.push(XMLNode::Element(generator_el));

        root.children
            .push(XMLNode::Element(self.engine_element.lock().clone()));

        xml::write_document(&self.metadata_file, &root)?;
        Ok(())
    }
}

/// Builds [`TableMetadata`] instances for a database directory and persists
/// their metadata documents under `<dir>/xflat_metadata/`.
pub struct TableMetadataFactory {
    directory: PathBuf,
    metadata_dir: PathBuf,
    pool: Arc<TaskPool>,
    txns: Arc<TransactionManager>,
    weak_self: Weak<TableMetadataFactory>,
}

impl TableMetadataFactory {
    pub fn new(
        directory: PathBuf,
        pool: Arc<TaskPool>,
        txns: Arc<TransactionManager>,
    ) -> Result<Arc<Self>> {
        let metadata_dir = directory.join("xflat_metadata");
        std::fs::create_dir_all(&metadata_dir)?;
        Ok(Arc::new_cyclic(|weak| Self {
            directory,
            metadata_dir,
            pool,
            txns,
            weak_self: weak.clone(),
        }))
    }

    /// Metadata for a top-level table. A saved metadata document wins over
    /// `default_config`; fresh tables start from the default and persist it
    /// on first spin-down.
    pub fn table_metadata(
        &self,
        name: &str,
        default_config: TableConfig,
    ) -> Result<Arc<TableMetadata>> {
        let metadata_file = self.metadata_dir.join(format!("{name}.metadata.xml"));
        // the stored config decides the engine shape, so resolve it before
        // choosing between a table file and a shard directory
        let config = self.load_config(&metadata_file)?.unwrap_or(default_config);
        let engine_path = if config.is_sharded() {
            self.directory.join(name)
        } else {
            self.directory.join(format!("{name}.xml"))
        };
        self.build(name.to_string(), engine_path, metadata_file, config)
    }

    fn load_config(&self, metadata_file: &PathBuf) -> Result<Option<TableConfig>> {
        if !metadata_file.exists() {
            return Ok(None);
        }
        let doc = xml::read_document(metadata_file)?;
        Ok(xml::child_by_name(&doc, CONFIG_TAG)
            .and_then(|el| serde_json::from_str(&xml::text_of(el)).ok()))
    }

    fn build(
        &self,
        name: String,
        engine_path: PathBuf,
        metadata_file: PathBuf,
        config: TableConfig,
    ) -> Result<Arc<TableMetadata>> {
        let (generator_el, engine_el) = if metadata_file.exists() {
            let doc = xml::read_document(&metadata_file)?;
            (
                xml::child_by_name(&doc, GENERATOR_TAG)
                    .cloned()
                    .unwrap_or_else(|| Element::new(GENERATOR_TAG)),
                xml::child_by_name(&doc, ENGINE_TAG)
                    .cloned()
                    .unwrap_or_else(|| Element::new(ENGINE_TAG)),
            )
        } else {
            (Element::new(GENERATOR_TAG), Element::new(ENGINE_TAG))
        };

        let generator: Arc<dyn IdGenerator> = match config.id_generator {
            IdGeneratorKind::Uuid => Arc::new(UuidIdGenerator),
            IdGeneratorKind::Integer => Arc::new(IntegerIdGenerator::new()),
        };
        generator.load_state(&generator_el);

        let shard_factory = self
            .weak_self
            .upgrade()
            .ok_or_else(|| XFlatError::EngineState("metadata factory dropped".into()))?;

        Ok(Arc::new(TableMetadata {
            name,
            file: engine_path,
            metadata_file,
            config,
            generator,
            engine_element: Mutex::new(engine_el),
            last_activity: AtomicI64::new(now_millis()),
            engine: Mutex::new(None),
            shard_factory,
            txns: Arc::clone(&self.txns),
            pool: Arc::clone(&self.pool),
        }))
    }
}

impl ShardMetadataFactory for TableMetadataFactory {
    fn shard_metadata(
        &self,
        parent: &str,
        shard_name: &str,
        file: PathBuf,
        config: TableConfig,
    ) -> Result<Arc<TableMetadata>> {
        let child_name = format!("{parent}:{shard_name}");
        // shards materialise on disk as soon as they exist logically
        if !file.exists() {
            if let Some(dir) = file.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let empty = xml::build_table_document(&child_name, &[]);
            xml::write_document(&file, &empty)?;
        }
        let metadata_file = self
            .metadata_dir
            .join(format!("{parent}.{shard_name}.metadata.xml"));
        self.build(child_name, file, metadata_file, config)
    }

    fn persist(&self, metadata: &TableMetadata) -> Result<()> {
        metadata.save_metadata()
    }
}
