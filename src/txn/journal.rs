//! Open-transaction journal
//!
//! Append-only JSON-lines file recording transaction lifecycle events. A
//! crash leaves behind `open` records without a matching `commit`; recovery
//! replays the file and reverts exactly those transactions on every engine.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::txn::TransactionId;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record {
    Open { tx: TransactionId },
    Commit { tx: TransactionId, commit: i64 },
    Close { tx: TransactionId },
}

pub(crate) struct Journal {
    path: PathBuf,
    file: File,
}

/// Transactions reconstructed from a journal after a crash.
#[derive(Debug, Default)]
pub(crate) struct JournalState {
    /// Transactions with an `open` record but no `commit`.
    pub unresolved: Vec<TransactionId>,
    /// Committed transactions and their commit ids.
    pub committed: BTreeMap<TransactionId, i64>,
    /// Highest id seen anywhere in the journal.
    pub max_id: i64,
}

impl Journal {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Replay the journal from disk.
    pub fn replay(&self) -> Result<JournalState> {
        let mut state = JournalState::default();
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // A torn trailing record from a crash mid-append is expected.
            let record: Record = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed journal record");
                    continue;
                }
            };
            match record {
                Record::Open { tx } => {
                    state.max_id = state.max_id.max(tx);
                    state.unresolved.push(tx);
                }
                Record::Commit { tx, commit } => {
                    state.max_id = state.max_id.max(commit);
                    state.unresolved.retain(|id| *id != tx);
                    state.committed.insert(tx, commit);
                }
                Record::Close { tx } => {
                    state.unresolved.retain(|id| *id != tx);
                }
            }
        }
        Ok(state)
    }

    pub fn record_open(&mut self, tx: TransactionId) -> Result<()> {
        self.append(&Record::Open { tx })
    }

    pub fn record_commit(&mut self, tx: TransactionId, commit: i64) -> Result<()> {
        self.append(&Record::Commit { tx, commit })
    }

    pub fn record_close(&mut self, tx: TransactionId) -> Result<()> {
        self.append(&Record::Close { tx })
    }

    /// Discard all journal content once recovery has resolved it.
    pub fn truncate(&mut self) -> Result<()> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}
