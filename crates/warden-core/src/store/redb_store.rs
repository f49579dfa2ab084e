//! # redb-backed Record Store
//!
//! A disk-backed `RecordStore` using the redb embedded database, providing:
//! - ACID batches (one redb write transaction per `apply`)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (readers never block on the writer)
//!
//! ## Layout
//!
//! - one table per record type: `id(u64) -> (token(u64), payload bytes)`
//! - `_warden_sequences`: record type -> next id
//! - `_warden_metadata`: `next_token` -> next concurrency token
//!
//! ## Explicit Transactions
//!
//! `begin_transaction` keeps one redb `WriteTransaction` open until commit or
//! rollback. Reads made meanwhile go through that transaction, so they see
//! its uncommitted writes. redb admits one writer per database: a second
//! store sharing the same `Database` blocks on its next write until the
//! transaction ends.
//!
//! Aborting the transaction would also roll back the sequence and token
//! tables. Rollback therefore re-commits the high-water marks reached inside
//! the transaction, so ids and tokens it handed out are never reused.

use super::{RecordStore, StoredRow, WriteOp, WriteOutcome, check_update, validate_table};
use crate::primitives::{FIRST_RECORD_ID, FIRST_TOKEN};
use crate::{ConcurrencyToken, ConflictSet, RecordId, WardenError};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition, TableError,
    WriteTransaction,
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Row value: (concurrency token, encoded record).
type RowValue = (u64, &'static [u8]);

/// Table for id sequences: record type -> next id.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("_warden_sequences");

/// Table for store metadata: key -> value.
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("_warden_metadata");

/// Metadata key holding the next concurrency token.
const NEXT_TOKEN: &str = "next_token";

fn rows_table(table: &str) -> TableDefinition<'_, u64, RowValue> {
    TableDefinition::new(table)
}

fn store_err(e: impl fmt::Display) -> WardenError {
    WardenError::StoreError(e.to_string())
}

/// Counters reached inside an open transaction.
#[derive(Debug, Default)]
struct HighWater {
    /// record type -> next id
    sequences: BTreeMap<String, u64>,
    next_token: Option<u64>,
}

impl HighWater {
    fn observe(&mut self, ops: &[WriteOp], outcomes: &[WriteOutcome]) {
        for (op, outcome) in ops.iter().zip(outcomes) {
            let token = match outcome {
                WriteOutcome::Inserted { id, token } => {
                    let next = self.sequences.entry(op.table().to_string()).or_default();
                    *next = (*next).max(id.0.saturating_add(1));
                    *token
                }
                WriteOutcome::Updated { token } => *token,
                WriteOutcome::Deleted { .. } => continue,
            };
            let next = token.0.saturating_add(1);
            self.next_token = Some(self.next_token.map_or(next, |t| t.max(next)));
        }
    }

    fn is_empty(&self) -> bool {
        self.sequences.is_empty() && self.next_token.is_none()
    }

    /// Raise the stored counters to at least these marks.
    fn persist(&self, db: &Database) -> Result<(), WardenError> {
        let txn = db.begin_write().map_err(store_err)?;
        {
            let mut sequences = txn.open_table(SEQUENCES).map_err(store_err)?;
            for (table, next) in &self.sequences {
                let current = sequences
                    .get(table.as_str())
                    .map_err(store_err)?
                    .map_or(FIRST_RECORD_ID, |v| v.value());
                if *next > current {
                    sequences.insert(table.as_str(), *next).map_err(store_err)?;
                }
            }
            if let Some(next) = self.next_token {
                let mut metadata = txn.open_table(METADATA).map_err(store_err)?;
                let current = metadata
                    .get(NEXT_TOKEN)
                    .map_err(store_err)?
                    .map_or(FIRST_TOKEN, |v| v.value());
                if next > current {
                    metadata.insert(NEXT_TOKEN, next).map_err(store_err)?;
                }
            }
        }
        txn.commit().map_err(store_err)
    }
}

/// A disk-backed record store using redb.
pub struct RedbStore {
    /// The redb database handle, shareable between per-unit-of-work stores.
    db: Arc<Database>,
    /// Write transaction held open by `begin_transaction`.
    open: Option<WriteTransaction>,
    /// Counters handed out under `open`.
    high_water: HighWater,
}

impl fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbStore")
            .field("in_transaction", &self.open.is_some())
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a record database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let db = Database::create(path.as_ref()).map_err(|e| WardenError::IoError(e.to_string()))?;

        // Initialize internal tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(store_err)?;
            let _ = write_txn.open_table(SEQUENCES).map_err(store_err)?;
            let _ = write_txn.open_table(METADATA).map_err(store_err)?;
            write_txn.commit().map_err(store_err)?;
        }

        tracing::debug!(target: "warden::store", path = %path.as_ref().display(), "redb store opened");
        Ok(Self::with_database(Arc::new(db)))
    }

    /// Build a store over an already-open database.
    ///
    /// This is how several sessions (one per unit of work) share one file.
    #[must_use]
    pub fn with_database(db: Arc<Database>) -> Self {
        Self {
            db,
            open: None,
            high_water: HighWater::default(),
        }
    }

    /// The shared database handle.
    #[must_use]
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// A fresh store over the same database, with no open transaction.
    #[must_use]
    pub fn sibling(&self) -> Self {
        Self::with_database(self.database())
    }
}

// =============================================================================
// ROW HELPERS
// =============================================================================

fn read_one<T>(table: &T, id: RecordId) -> Result<Option<StoredRow>, WardenError>
where
    T: ReadableTable<u64, RowValue>,
{
    Ok(table.get(id.0).map_err(store_err)?.map(|guard| {
        let (token, payload) = guard.value();
        StoredRow {
            id,
            token: ConcurrencyToken(token),
            payload: payload.to_vec(),
        }
    }))
}

fn read_all<T>(table: &T) -> Result<Vec<StoredRow>, WardenError>
where
    T: ReadableTable<u64, RowValue>,
{
    let mut rows = Vec::new();
    for entry in table.iter().map_err(store_err)? {
        let (key, value) = entry.map_err(store_err)?;
        let (token, payload) = value.value();
        rows.push(StoredRow {
            id: RecordId(key.value()),
            token: ConcurrencyToken(token),
            payload: payload.to_vec(),
        });
    }
    Ok(rows)
}

/// Validate, then write, a batch inside `txn`.
fn apply_in(txn: &WriteTransaction, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, WardenError> {
    // Pass 1: compare every guarded update before writing anything.
    let mut conflicts = Vec::new();
    for op in ops {
        if let WriteOp::Update {
            table,
            id,
            expected,
            ..
        } = op
        {
            let rows = txn.open_table(rows_table(table)).map_err(store_err)?;
            let actual = read_one(&rows, *id)?.map(|row| row.token);
            if let Some(conflict) = check_update(*table, *id, *expected, actual) {
                conflicts.push(conflict);
            }
        }
    }
    if !conflicts.is_empty() {
        return Err(WardenError::Conflict(ConflictSet::new(conflicts)));
    }

    // Pass 2: apply.
    let mut sequences = txn.open_table(SEQUENCES).map_err(store_err)?;
    let mut metadata = txn.open_table(METADATA).map_err(store_err)?;
    let mut next_token = metadata
        .get(NEXT_TOKEN)
        .map_err(store_err)?
        .map(|v| v.value())
        .unwrap_or(FIRST_TOKEN);

    let mut outcomes = Vec::with_capacity(ops.len());
    for op in ops {
        let mut rows = txn.open_table(rows_table(op.table())).map_err(store_err)?;
        let outcome = match op {
            WriteOp::Insert { table, payload } => {
                let id = sequences
                    .get(*table)
                    .map_err(store_err)?
                    .map(|v| v.value())
                    .unwrap_or(FIRST_RECORD_ID);
                sequences
                    .insert(*table, id.saturating_add(1))
                    .map_err(store_err)?;

                let token = next_token;
                next_token = next_token.saturating_add(1);
                rows.insert(id, (token, payload.as_slice()))
                    .map_err(store_err)?;
                WriteOutcome::Inserted {
                    id: RecordId(id),
                    token: ConcurrencyToken(token),
                }
            }
            WriteOp::Update { id, payload, .. } => {
                let token = next_token;
                next_token = next_token.saturating_add(1);
                rows.insert(id.0, (token, payload.as_slice()))
                    .map_err(store_err)?;
                WriteOutcome::Updated {
                    token: ConcurrencyToken(token),
                }
            }
            WriteOp::Delete { id, .. } => {
                let existed = rows.remove(id.0).map_err(store_err)?.is_some();
                WriteOutcome::Deleted { existed }
            }
        };
        outcomes.push(outcome);
    }

    metadata
        .insert(NEXT_TOKEN, next_token)
        .map_err(store_err)?;
    Ok(outcomes)
}

// =============================================================================
// RECORDSTORE TRAIT IMPLEMENTATION
// =============================================================================

impl RecordStore for RedbStore {
    fn get(&self, table: &str, id: RecordId) -> Result<Option<StoredRow>, WardenError> {
        if let Some(txn) = &self.open {
            let rows = txn.open_table(rows_table(table)).map_err(store_err)?;
            return read_one(&rows, id);
        }

        let read_txn = self.db.begin_read().map_err(store_err)?;
        match read_txn.open_table(rows_table(table)) {
            Ok(rows) => read_one(&rows, id),
            Err(TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    fn scan(&self, table: &str) -> Result<Vec<StoredRow>, WardenError> {
        if let Some(txn) = &self.open {
            let rows = txn.open_table(rows_table(table)).map_err(store_err)?;
            return read_all(&rows);
        }

        let read_txn = self.db.begin_read().map_err(store_err)?;
        match read_txn.open_table(rows_table(table)) {
            Ok(rows) => read_all(&rows),
            Err(TableError::TableDoesNotExist(_)) => Ok(Vec::new()),
            Err(e) => Err(store_err(e)),
        }
    }

    fn count(&self, table: &str) -> Result<usize, WardenError> {
        if let Some(txn) = &self.open {
            let rows = txn.open_table(rows_table(table)).map_err(store_err)?;
            return Ok(rows.len().map_err(store_err)? as usize);
        }

        let read_txn = self.db.begin_read().map_err(store_err)?;
        match read_txn.open_table(rows_table(table)) {
            Ok(rows) => Ok(rows.len().map_err(store_err)? as usize),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(store_err(e)),
        }
    }

    fn apply(&mut self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, WardenError> {
        for op in ops {
            validate_table(op.table())?;
        }

        if let Some(txn) = &self.open {
            let outcomes = apply_in(txn, ops)?;
            self.high_water.observe(ops, &outcomes);
            return Ok(outcomes);
        }

        let write_txn = self.db.begin_write().map_err(store_err)?;
        match apply_in(&write_txn, ops) {
            Ok(outcomes) => {
                write_txn.commit().map_err(store_err)?;
                Ok(outcomes)
            }
            Err(e) => {
                if let Err(abort) = write_txn.abort() {
                    tracing::warn!(target: "warden::store", error = %abort, "abort after failed batch");
                }
                Err(e)
            }
        }
    }

    fn begin_transaction(&mut self) -> Result<(), WardenError> {
        if self.open.is_some() {
            return Err(WardenError::InvalidState(
                "redb store already has an open transaction".to_string(),
            ));
        }
        self.open = Some(self.db.begin_write().map_err(store_err)?);
        self.high_water = HighWater::default();
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), WardenError> {
        let txn = self
            .open
            .take()
            .ok_or_else(|| WardenError::InvalidState("no open transaction".to_string()))?;
        let committed = txn.commit().map_err(store_err);
        let high_water = std::mem::take(&mut self.high_water);
        if committed.is_err() && !high_water.is_empty() {
            high_water.persist(&self.db)?;
        }
        committed
    }

    fn rollback_transaction(&mut self) -> Result<(), WardenError> {
        let txn = self
            .open
            .take()
            .ok_or_else(|| WardenError::InvalidState("no open transaction".to_string()))?;
        let aborted = txn.abort().map_err(store_err);
        let high_water = std::mem::take(&mut self.high_water);
        if !high_water.is_empty() {
            tracing::debug!(
                target: "warden::store",
                tables = high_water.sequences.len(),
                "keeping counters of rolled-back transaction"
            );
            high_water.persist(&self.db)?;
        }
        aborted
    }

    fn in_transaction(&self) -> bool {
        self.open.is_some()
    }
}

// =============================================================================
// TESTS
// =============================================================================
