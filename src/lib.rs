//! XFlat storage core
//!
//! An embedded document database core that persists tables as XML files on
//! local disk and serves transactional reads and writes from an in-memory
//! multi-version cache.
//!
//! ## Architecture
//! - Storage: one cached-document engine per table holding the full table
//!   in memory, durably dumped to `<table>.xml` with coalesced writes
//! - Sharding: large tables partition into interval-keyed child engines,
//!   one `<interval>.xml` file each, created lazily and retired when idle
//! - Transactions: MVCC row versions with read-committed and snapshot
//!   isolation, coordinated across engines by time-ordered commit ids
//! - Lifecycle: engines move through spin-up → running → spin-down under a
//!   compare-and-set state machine, with maintenance on a shared task pool

pub mod config;
pub mod engine;
pub mod idgen;
pub mod metadata;
pub mod query;
pub mod scheduler;
pub mod txn;
pub mod xml;

mod error;

pub use config::{IdGeneratorKind, TableConfig};
pub use engine::cached::{CachedDocumentEngine, EngineStats};
pub use engine::interval::{FixedWidthIntervalProvider, Interval, IntervalProvider};
pub use engine::sharded::{IdShardedEngine, ShardConfig, ShardMetadataFactory, ShardStats};
pub use engine::{Engine, EngineState, RowCursor};
pub use error::{Result, XFlatError};
pub use idgen::{IdGenerator, IntegerIdGenerator, UuidIdGenerator};
pub use metadata::{TableMetadata, TableMetadataFactory};
pub use query::{RowMatcher, RowUpdate, ShardSelector};
pub use scheduler::TaskPool;
pub use txn::{Isolation, Transaction, TransactionManager, TransactionOptions, TransactionScope};
