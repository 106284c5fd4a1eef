//! MVCC row store
//!
//! A [`Row`] maps writer transaction id to [`RowData`], one version per
//! transaction. Visibility follows commit ids: a reader inside transaction
//! `T` sees its own version first, otherwise the newest version committed
//! at or before `T` started. All access to one row is serialised by the
//! row's own mutex; physical removal of a row from the cache additionally
//! requires the table write lock held by the caller.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use xmltree::Element;

use crate::error::{Result, XFlatError};
use crate::query::RowUpdate;
use crate::txn::Transaction;
pub use crate::txn::UNCOMMITTED;

/// One version of a row.
#[derive(Debug, Clone)]
pub struct RowData {
    /// The row this version belongs to.
    pub row_id: String,
    /// The writer's transaction id; also the version's key in the row.
    pub transaction_id: i64,
    /// [`UNCOMMITTED`] until the writer commits; assigned once, never
    /// rewritten.
    pub commit_id: i64,
    /// Stored content; `None` marks a deletion tombstone.
    pub element: Option<Element>,
}

impl RowData {
    pub fn is_tombstone(&self) -> bool {
        self.element.is_none()
    }

    pub fn is_committed(&self) -> bool {
        self.commit_id != UNCOMMITTED
    }
}

/// The version cell for one row id.
pub struct Row {
    row_id: String,
    versions: Mutex<BTreeMap<i64, RowData>>,
}

impl Row {
    pub fn new(row_id: &str) -> Self {
        Self {
            row_id: row_id.to_string(),
            versions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Rebuild a row from durable versions at spin-up.
    pub fn from_versions(row_id: &str, versions: Vec<RowData>) -> Self {
        let row = Self::new(row_id);
        {
            let mut map = row.versions.lock();
            for data in versions {
                map.insert(data.transaction_id, data);
            }
        }
        row
    }

    pub fn row_id(&self) -> &str {
        &self.row_id
    }

    /// The version a reader in `tx` (possibly absent) observes, bounded by
    /// `cap`:
    /// own uncommitted version first, otherwise the committed version with
    /// the greatest commit id not exceeding `cap` nor the reader's
    /// transaction id. A tombstone is a valid result; callers treat it as
    /// "no row".
    pub fn choose_most_recent_committed(
        &self,
        tx: Option<&Transaction>,
        cap: i64,
    ) -> Option<RowData> {
        let versions = self.versions.lock();
        Self::choose_locked(&versions, tx, cap).cloned()
    }

    fn choose_locked<'a>(
        versions: &'a BTreeMap<i64, RowData>,
        tx: Option<&Transaction>,
        cap: i64,
    ) -> Option<&'a RowData> {
        if let Some(tx) = tx {
            if let Some(own) = versions.get(&tx.id()) {
                return Some(own);
            }
        }
        let tx_bound = tx.map(|t| t.id()).unwrap_or(i64::MAX);
        versions
            .values()
            .filter(|v| v.is_committed() && v.commit_id <= cap && v.commit_id <= tx_bound)
            .max_by_key(|v| v.commit_id)
    }

    /// Install a version unconditionally, replacing any prior version by
    /// the same transaction.
    pub fn put(&self, data: RowData) {
        self.versions.lock().insert(data.transaction_id, data);
    }

    /// Insert semantics: fails when a visible non-tombstone version exists.
    /// Visibility is capped at the transaction's own start so concurrent
    /// later commits do not affect the outcome.
    pub fn insert_version(&self, tx: Option<&Transaction>, data: RowData) -> Result<()> {
        let mut versions = self.versions.lock();
        let cap = tx.map(|t| t.id()).unwrap_or(i64::MAX);
        let occupied = matches!(
            Self::choose_locked(&versions, tx, cap),
            Some(visible) if !visible.is_tombstone()
        );
        if occupied {
            return Err(XFlatError::DuplicateKey(self.row_id.clone()));
        }
        versions.insert(data.transaction_id, data);
        Ok(())
    }

    /// Replace semantics: fails when no non-tombstone version is visible.
    pub fn replace_version(&self, tx: Option<&Transaction>, data: RowData) -> Result<()> {
        let mut versions = self.versions.lock();
        let visible = matches!(
            Self::choose_locked(&versions, tx, i64::MAX),
            Some(visible) if !visible.is_tombstone()
        );
        if !visible {
            return Err(XFlatError::KeyNotFound(self.row_id.clone()));
        }
        versions.insert(data.transaction_id, data);
        Ok(())
    }

    /// Upsert semantics: always installs; returns true when no
    /// non-tombstone version was visible (an insert).
    pub fn upsert_version(&self, tx: Option<&Transaction>, data: RowData) -> bool {
        let mut versions = self.versions.lock();
        let inserted = !matches!(
            Self::choose_locked(&versions, tx, i64::MAX),
            Some(visible) if !visible.is_tombstone()
        );
        versions.insert(data.transaction_id, data);
        inserted
    }

    /// Delete semantics: installs the tombstone in `data`; fails when no
    /// non-tombstone version is visible.
    pub fn delete_version(&self, tx: Option<&Transaction>, data: RowData) -> Result<()> {
        debug_assert!(data.is_tombstone());
        self.replace_version(tx, data)
    }

    /// Apply `update` to a clone of the visible version and install the
    /// result as a new version only when the content changed. Returns
    /// whether it did.
    pub fn update_version(
        &self,
        tx: Option<&Transaction>,
        transaction_id: i64,
        commit_id: i64,
        update: &dyn RowUpdate,
    ) -> Result<bool> {
        let mut versions = self.versions.lock();
        let original = match Self::choose_locked(&versions, tx, i64::MAX) {
            Some(visible) => match &visible.element {
                Some(element) => element.clone(),
                None => return Err(XFlatError::KeyNotFound(self.row_id.clone())),
            },
            None => return Err(XFlatError::KeyNotFound(self.row_id.clone())),
        };
        let mut updated = original.clone();
        update.apply(&mut updated)?;
        if updated == original {
            return Ok(false);
        }
        versions.insert(
            transaction_id,
            RowData {
                row_id: self.row_id.clone(),
                transaction_id,
                commit_id,
                element: Some(updated),
            },
        );
        Ok(true)
    }

    /// Remove the version written by `tx_id`, if any.
    pub fn remove_version(&self, tx_id: i64) -> Option<RowData> {
        self.versions.lock().remove(&tx_id)
    }

    /// Stamp the commit id onto the version written by `tx_id`.
    pub fn assign_commit_id(&self, tx_id: i64, commit_id: i64) {
        if let Some(data) = self.versions.lock().get_mut(&tx_id) {
            if !data.is_committed() {
                data.commit_id = commit_id;
            }
        }
    }

    pub fn has_version_of(&self, tx_id: i64) -> bool {
        self.versions.lock().contains_key(&tx_id)
    }

    pub fn has_uncommitted(&self) -> bool {
        self.versions.lock().values().any(|v| !v.is_committed())
    }

    /// Transaction ids of the uncommitted versions in this row.
    pub fn uncommitted_transaction_ids(&self) -> Vec<i64> {
        self.versions
            .lock()
            .values()
            .filter(|v| !v.is_committed())
            .map(|v| v.transaction_id)
            .collect()
    }

    /// True when a version committed after `after` by a transaction other
    /// than `excluding_tx` exists — the snapshot write-conflict test.
    pub fn has_committed_after(&self, after: i64, excluding_tx: i64) -> bool {
        self.versions
            .lock()
            .values()
            .any(|v| v.is_committed() && v.commit_id > after && v.transaction_id != excluding_tx)
    }

    /// Committed versions in commit order, for the durable dump.
    pub fn committed_versions(&self) -> Vec<RowData> {
        let versions = self.versions.lock();
        let mut committed: Vec<RowData> = versions
            .values()
            .filter(|v| v.is_committed())
            .cloned()
            .collect();
        committed.sort_by_key(|v| v.commit_id);
        committed
    }

    /// Discard committed versions that no transaction can ever observe
    /// again: a version is dead once a strictly newer committed version
    /// exists and no open transaction's snapshot falls in the window where
    /// the older version was still the visible one.
    ///
    /// Returns true when the row is eligible for physical removal: nothing
    /// left, or only committed tombstones. The caller must re-check under
    /// the table write lock before dropping the row.
    pub fn cleanup(&self, open_transactions: &BTreeSet<i64>) -> bool {
        let mut versions = self.versions.lock();

        let mut commits: Vec<(i64, i64)> = versions
            .values()
            .filter(|v| v.is_committed())
            .map(|v| (v.commit_id, v.transaction_id))
            .collect();
        commits.sort_unstable();

        if commits.len() > 1 {
            let mut dead = Vec::new();
            for window in commits.windows(2) {
                let (commit, tx_key) = window[0];
                let next_commit = window[1].0;
                let observed = open_transactions.range(commit..next_commit).next().is_some();
                if !observed {
                    dead.push(tx_key);
                }
            }
            for tx_key in dead {
                versions.remove(&tx_key);
            }
        }

        versions.is_empty() || versions.values().all(|v| v.is_committed() && v.is_tombstone())
    }
}
