//! Table configuration
//!
//! Tuning knobs for a single logical table: how aggressively the engine
//! coalesces durable dumps, how often background maintenance runs, when an
//! idle engine is retired, and how row IDs are generated. The config is
//! embedded as JSON inside the per-table metadata document so it survives
//! engine spin-down.

use serde::{Deserialize, Serialize};

/// How row identifiers are produced when the caller does not supply one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdGeneratorKind {
    /// Stateless random UUIDs. String IDs only.
    Uuid,
    /// Monotonic integer counter, persisted with the table metadata.
    Integer,
}

/// Per-table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Milliseconds a table may sit idle before its engine is spun down.
    pub inactivity_shutdown_ms: u64,

    /// Minimum gap between two deferred durable dumps. A write landing
    /// inside the window schedules the dump at the end of the window.
    pub dump_coalesce_ms: u64,

    /// Cadence of the background maintenance task (version cleanup for
    /// cached engines, shard retirement for sharded engines).
    pub maintenance_interval_ms: u64,

    /// When set, the table is id-sharded: rows are partitioned into one
    /// file per half-open interval of this width.
    pub shard_width: Option<i64>,

    /// Base offset for the shard intervals.
    pub shard_base: i64,

    /// Row-id generation strategy.
    pub id_generator: IdGeneratorKind,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            inactivity_shutdown_ms: 3000,
            dump_coalesce_ms: 250,
            maintenance_interval_ms: 500,
            shard_width: None,
            shard_base: 0,
            id_generator: IdGeneratorKind::Uuid,
        }
    }
}

impl TableConfig {
    /// Config for an id-sharded table with fixed-width integer intervals.
    pub fn sharded(width: i64) -> Self {
        Self {
            shard_width: Some(width),
            id_generator: IdGeneratorKind::Integer,
            ..Default::default()
        }
    }

    /// True when this table routes rows through a sharded engine.
    pub fn is_sharded(&self) -> bool {
        self.shard_width.is_some()
    }

    /// Config handed to the child engine of one shard. Children are plain
    /// cached engines, so the sharding fields are cleared.
    pub fn shard_child(&self) -> Self {
        Self {
            shard_width: None,
            ..self.clone()
        }
    }
}
