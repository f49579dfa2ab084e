//! # Record Store Contract
//!
//! The persistence collaborator consumed by the data-access layer.
//!
//! A store provides three capabilities:
//! - a typed record set per record type (`get`, `scan`, `count`)
//! - raw rows for the layer's composable `Query` handle (`scan`)
//! - atomic batched writes and explicit transactions
//!
//! ## Write Semantics
//!
//! Last write wins, unless the writer presents a concurrency token that no
//! longer matches the stored row. Token comparison happens here, inside the
//! store, never in the accessors. A batch with any mismatch writes nothing
//! and reports every mismatching row at once.
//!
//! ## Backends
//!
//! - `MemoryStore`: BTreeMap tables with snapshot transactions (volatile)
//! - `RedbStore`: redb database file (ACID, persistent)

mod memory;
mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::primitives::RESERVED_TABLE_PREFIX;
use crate::{ConcurrencyToken, ConflictedRow, RecordId, WardenError};
use std::fmt;

// =============================================================================
// ROWS & WRITE OPERATIONS
// =============================================================================

/// A row as the store keeps it: identity, version and opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Store-assigned identity.
    pub id: RecordId,
    /// Token of the last physical write.
    pub token: ConcurrencyToken,
    /// Encoded record.
    pub payload: Vec<u8>,
}

/// One write in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert a new row; the store assigns id and token.
    Insert {
        /// Record type.
        table: &'static str,
        /// Encoded record.
        payload: Vec<u8>,
    },
    /// Overwrite an existing row.
    ///
    /// Fails the batch if the row is gone, or if `expected` is set and
    /// differs from the stored token.
    Update {
        /// Record type.
        table: &'static str,
        /// Row to overwrite.
        id: RecordId,
        /// Token the writer read, if the write is guarded.
        expected: Option<ConcurrencyToken>,
        /// Encoded record.
        payload: Vec<u8>,
    },
    /// Remove a row. Missing rows are not an error.
    Delete {
        /// Record type.
        table: &'static str,
        /// Row to remove.
        id: RecordId,
    },
}

impl WriteOp {
    /// Record type this operation targets.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                *table
            }
        }
    }
}

/// Result of one applied write, positionally matching its `WriteOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Row inserted with this identity and token.
    Inserted {
        /// Assigned identity.
        id: RecordId,
        /// Assigned token.
        token: ConcurrencyToken,
    },
    /// Row overwritten; new token.
    Updated {
        /// New token.
        token: ConcurrencyToken,
    },
    /// Row removed (or already absent).
    Deleted {
        /// Whether a row existed.
        existed: bool,
    },
}

// =============================================================================
// RECORDSTORE TRAIT
// =============================================================================

/// The persistence capability a `Session` is built on.
///
/// Implementations must be correct against "last write wins unless the
/// concurrency token mismatches". Every method is a store round-trip.
pub trait RecordStore: fmt::Debug {
    /// Fetch one row.
    fn get(&self, table: &str, id: RecordId) -> Result<Option<StoredRow>, WardenError>;

    /// Fetch every row of a record type, ordered by id.
    fn scan(&self, table: &str) -> Result<Vec<StoredRow>, WardenError>;

    /// Number of rows of a record type.
    fn count(&self, table: &str) -> Result<usize, WardenError> {
        Ok(self.scan(table)?.len())
    }

    /// Apply a batch atomically.
    ///
    /// Validates every guarded update before writing anything. On mismatch
    /// returns `WardenError::Conflict` listing all flagged rows and leaves
    /// the store untouched. Joins the open explicit transaction, if any.
    fn apply(&mut self, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, WardenError>;

    /// Open an explicit transaction.
    fn begin_transaction(&mut self) -> Result<(), WardenError>;

    /// Make the open transaction durable.
    fn commit_transaction(&mut self) -> Result<(), WardenError>;

    /// Discard every write made since `begin_transaction`.
    fn rollback_transaction(&mut self) -> Result<(), WardenError>;

    /// Whether an explicit transaction is open.
    fn in_transaction(&self) -> bool;
}

// =============================================================================
// SHARED VALIDATION
// =============================================================================

/// Reject record types that collide with store-internal tables.
pub(crate) fn validate_table(table: &str) -> Result<(), WardenError> {
    if table.is_empty() || table.starts_with(RESERVED_TABLE_PREFIX) {
        return Err(WardenError::InvalidArgument(format!(
            "record type '{}' is empty or uses the reserved prefix '{}'",
            table, RESERVED_TABLE_PREFIX
        )));
    }
    Ok(())
}

/// Compare a guarded update against the stored token.
///
/// Returns the conflict entry if the write must be refused.
pub(crate) fn check_update(
    table: &'static str,
    id: RecordId,
    expected: Option<ConcurrencyToken>,
    actual: Option<ConcurrencyToken>,
) -> Option<ConflictedRow> {
    let refused = match (expected, actual) {
        (_, None) => true,
        (Some(expected), Some(actual)) => expected != actual,
        (None, Some(_)) => false,
    };
    refused.then_some(ConflictedRow {
        record_type: table,
        id,
        expected,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tables_rejected() {
        assert!(validate_table("risks").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("_warden_sequences").is_err());
    }

    #[test]
    fn check_update_rules() {
        let t = ConcurrencyToken;
        // Unguarded write on an existing row: last write wins.
        assert!(check_update("risks", RecordId(1), None, Some(t(3))).is_none());
        // Matching token.
        assert!(check_update("risks", RecordId(1), Some(t(3)), Some(t(3))).is_none());
        // Stale token.
        let stale = check_update("risks", RecordId(1), Some(t(2)), Some(t(3)));
        assert_eq!(stale.map(|c| c.actual), Some(Some(t(3))));
        // Row vanished, guarded or not.
        assert!(check_update("risks", RecordId(1), Some(t(2)), None).is_some());
        assert!(check_update("risks", RecordId(1), None, None).is_some());
    }
}
