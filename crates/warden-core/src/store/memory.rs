//! # In-Memory Record Store
//!
//! BTreeMap-backed `RecordStore`. Volatile; used for tests and for sessions
//! that do not need durability.
//!
//! Explicit transactions snapshot the rows on begin and restore them on
//! rollback. Id sequences and the token counter stay outside the snapshot,
//! so nothing handed out inside a rolled-back transaction is reused.

use super::{RecordStore, StoredRow, WriteOp, WriteOutcome, check_update, validate_table};
use crate::primitives::{FIRST_RECORD_ID, FIRST_TOKEN};
use crate::{ConcurrencyToken, ConflictSet, RecordId, WardenError};
use std::collections::BTreeMap;

/// One stored row: (token, payload).
type Row = (u64, Vec<u8>);

/// record type -> id -> row
type Rows = BTreeMap<String, BTreeMap<u64, Row>>;

/// Counters that only ever move forward.
#[derive(Debug, Clone, Default)]
struct Counters {
    /// record type -> next id to assign
    sequences: BTreeMap<String, u64>,
    /// Next token to hand out (0 means "not started").
    next_token: u64,
}

impl Counters {
    fn take_token(&mut self) -> ConcurrencyToken {
        let token = self.next_token.max(FIRST_TOKEN);
        self.next_token = token.saturating_add(1);
        ConcurrencyToken(token)
    }

    fn take_id(&mut self, table: &str) -> RecordId {
        let next = self
            .sequences
            .entry(table.to_string())
            .or_insert(FIRST_RECORD_ID);
        let id = *next;
        *next = next.saturating_add(1);
        RecordId(id)
    }
}

/// Volatile store keeping every record type in ordered maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Rows,
    counters: Counters,
    /// Rows at `begin_transaction`, restored on rollback.
    snapshot: Option<Rows>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of record types that have ever held a row.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.rows.len()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, table: &str, id: RecordId) -> Result<Option<StoredRow>, WardenError> {
        Ok(self
            .rows
            .get(table)
            .and_then(|rows| rows.get(&id.0))
            .map(|(token, payload)| StoredRow {
                id,
                token: ConcurrencyToken(*token),
                payload: payload.clone(),
            }))
    }

    fn scan(&self, table: &str) -> Result<Vec<StoredRow>, WardenError> {
        Ok(self
            .rows
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, (token, payload))| StoredRow {
                        id: RecordId(*id),
                        token: ConcurrencyToken(*token),
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count(&self, table: &str) -> Result<usize, WardenError> {
        Ok(self.rows.get(table).map_or(0, BTreeMap::len))
    }

    fn apply(&mut self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, WardenError> {
        // Pass 1: validate everything before touching any table.
        let mut conflicts = Vec::new();
        for op in ops {
            validate_table(op.table())?;
            if let WriteOp::Update {
                table,
                id,
                expected,
                ..
            } = op
            {
                let actual = self
                    .rows
                    .get(*table)
                    .and_then(|rows| rows.get(&id.0))
                    .map(|(token, _)| ConcurrencyToken(*token));
                if let Some(conflict) = check_update(*table, *id, *expected, actual) {
                    conflicts.push(conflict);
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(WardenError::Conflict(ConflictSet::new(conflicts)));
        }

        // Pass 2: apply. Nothing below can fail.
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            let outcome = match op {
                WriteOp::Insert { table, payload } => {
                    let id = self.counters.take_id(table);
                    let token = self.counters.take_token();
                    self.rows
                        .entry((*table).to_string())
                        .or_default()
                        .insert(id.0, (token.0, payload.clone()));
                    WriteOutcome::Inserted { id, token }
                }
                WriteOp::Update {
                    table, id, payload, ..
                } => {
                    let token = self.counters.take_token();
                    self.rows
                        .entry((*table).to_string())
                        .or_default()
                        .insert(id.0, (token.0, payload.clone()));
                    WriteOutcome::Updated { token }
                }
                WriteOp::Delete { table, id } => {
                    let existed = self
                        .rows
                        .get_mut(*table)
                        .and_then(|rows| rows.remove(&id.0))
                        .is_some();
                    WriteOutcome::Deleted { existed }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn begin_transaction(&mut self) -> Result<(), WardenError> {
        if self.snapshot.is_some() {
            return Err(WardenError::InvalidState(
                "memory store already has an open transaction".to_string(),
            ));
        }
        self.snapshot = Some(self.rows.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), WardenError> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| WardenError::InvalidState("no open transaction".to_string()))
    }

    fn rollback_transaction(&mut self) -> Result<(), WardenError> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| WardenError::InvalidState("no open transaction".to_string()))?;
        self.rows = snapshot;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn insert(table: &'static str, payload: &[u8]) -> WriteOp {
        WriteOp::Insert {
            table,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn insert_assigns_sequential_ids_per_table() {
        let mut store = MemoryStore::new();
        let out = store
            .apply(&[insert("risks", b"a"), insert("risks", b"b"), insert("tags", b"c")])
            .expect("apply");

        let ids: Vec<_> = out
            .iter()
            .map(|o| match o {
                WriteOutcome::Inserted { id, .. } => id.0,
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 1]);
        assert_eq!(store.count("risks").expect("count"), 2);
        assert_eq!(store.table_count(), 2);
    }

    #[test]
    fn every_write_gets_a_fresh_token() {
        let mut store = MemoryStore::new();
        store.apply(&[insert("risks", b"a")]).expect("insert");
        let before = store.get("risks", RecordId(1)).expect("get").unwrap();

        store
            .apply(&[WriteOp::Update {
                table: "risks",
                id: RecordId(1),
                expected: Some(before.token),
                payload: b"b".to_vec(),
            }])
            .expect("update");
        let after = store.get("risks", RecordId(1)).expect("get").unwrap();

        assert_ne!(before.token, after.token);
        assert_eq!(after.payload, b"b");
    }

    #[test]
    fn stale_token_rejects_whole_batch() {
        let mut store = MemoryStore::new();
        store
            .apply(&[insert("risks", b"a"), insert("risks", b"b")])
            .expect("insert");

        let result = store.apply(&[
            WriteOp::Update {
                table: "risks",
                id: RecordId(1),
                expected: Some(ConcurrencyToken(99)),
                payload: b"x".to_vec(),
            },
            insert("risks", b"c"),
            WriteOp::Update {
                table: "risks",
                id: RecordId(7),
                expected: None,
                payload: b"y".to_vec(),
            },
        ]);

        let Err(WardenError::Conflict(set)) = result else {
            panic!("expected conflict");
        };
        assert_eq!(set.len(), 2);
        assert!(set.contains("risks", RecordId(1)));
        assert!(set.contains("risks", RecordId(7)));
        // Nothing from the rejected batch landed.
        assert_eq!(store.count("risks").expect("count"), 2);
        assert_eq!(
            store.get("risks", RecordId(1)).expect("get").unwrap().payload,
            b"a"
        );
    }

    #[test]
    fn delete_missing_row_is_not_an_error() {
        let mut store = MemoryStore::new();
        let out = store
            .apply(&[WriteOp::Delete {
                table: "risks",
                id: RecordId(42),
            }])
            .expect("delete");
        assert_eq!(out, vec![WriteOutcome::Deleted { existed: false }]);
    }

    #[test]
    fn rollback_restores_rows_but_never_reuses_ids() {
        let mut store = MemoryStore::new();
        store.apply(&[insert("risks", b"a")]).expect("insert");

        store.begin_transaction().expect("begin");
        assert!(store.in_transaction());
        store.apply(&[insert("risks", b"b")]).expect("insert");
        assert_eq!(store.count("risks").expect("count"), 2);
        store.rollback_transaction().expect("rollback");

        assert!(!store.in_transaction());
        assert_eq!(store.count("risks").expect("count"), 1);
        assert!(store.get("risks", RecordId(2)).expect("get").is_none());
        let out = store.apply(&[insert("risks", b"c")]).expect("insert");
        assert!(matches!(
            out[0],
            WriteOutcome::Inserted { id: RecordId(3), .. }
        ));
    }

    #[test]
    fn transaction_misuse_is_invalid_state() {
        let mut store = MemoryStore::new();
        assert!(matches!(
            store.commit_transaction(),
            Err(WardenError::InvalidState(_))
        ));
        assert!(matches!(
            store.rollback_transaction(),
            Err(WardenError::InvalidState(_))
        ));
        store.begin_transaction().expect("begin");
        assert!(matches!(
            store.begin_transaction(),
            Err(WardenError::InvalidState(_))
        ));
    }

    #[test]
    fn reserved_table_rejected() {
        let mut store = MemoryStore::new();
        let result = store.apply(&[insert("_warden_meta", b"x")]);
        assert!(matches!(result, Err(WardenError::InvalidArgument(_))));
    }
}
