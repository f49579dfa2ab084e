//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the data-access layer:
//! - Record identifiers and concurrency tokens (`RecordId`, `ConcurrencyToken`)
//! - Provenance metadata (`AuditStamp`)
//! - Conflict reports (`ConflictedRow`, `ConflictSet`)
//! - Error types (`WardenError`)
//!
//! ## Absence Is Not Failure
//!
//! There is deliberately no `NotFound` variant. Lookups return `Option`,
//! deletes return `bool` or a count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Surrogate identity of a persisted record.
///
/// Assigned by the store on creation, unique within one record type,
/// immutable afterwards. Stores never reuse an id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Id carried by records that have not been created yet.
    pub const UNASSIGNED: Self = Self(0);

    /// Get the raw id value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether the store has assigned this id.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque version stamp changed by the store on every physical write of a row.
///
/// Only ever compared for equality, and only by the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ConcurrencyToken(pub u64);

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =============================================================================
// AUDIT STAMP
// =============================================================================

/// Creation / modification provenance carried by every auditable record.
///
/// All fields are owned by the accessor. Values supplied by callers are
/// overwritten on create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStamp {
    /// Set once, at creation.
    pub created_at: DateTime<Utc>,
    /// Acting principal at creation. Write-once.
    pub created_by: String,
    /// Set on every create and update. Never earlier than `created_at`.
    pub updated_at: DateTime<Utc>,
    /// Acting principal of the latest write.
    pub updated_by: String,
    /// Tombstone time, if the record was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Acting principal of the soft delete.
    pub deleted_by: Option<String>,
    /// Materialized from row metadata on read; never part of the payload.
    #[serde(skip)]
    pub concurrency_token: ConcurrencyToken,
}

impl Default for AuditStamp {
    fn default() -> Self {
        Self {
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            created_by: String::new(),
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_by: String::new(),
            deleted_at: None,
            deleted_by: None,
            concurrency_token: ConcurrencyToken::default(),
        }
    }
}

impl AuditStamp {
    /// Whether the record carries a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Stamp a brand-new record: both created and updated fields, tombstone cleared.
    pub fn stamp_created(&mut self, now: DateTime<Utc>, actor: &str) {
        self.created_at = now;
        self.created_by = actor.to_string();
        self.updated_at = now;
        self.updated_by = actor.to_string();
        self.deleted_at = None;
        self.deleted_by = None;
    }

    /// Stamp an update against the stored provenance.
    ///
    /// `created_*` and the tombstone are copied from `stored`, whatever the
    /// caller put in `self`. `updated_at` never moves backwards.
    pub fn stamp_updated(&mut self, stored: &AuditStamp, now: DateTime<Utc>, actor: &str) {
        self.created_at = stored.created_at;
        self.created_by.clone_from(&stored.created_by);
        self.deleted_at = stored.deleted_at;
        self.deleted_by.clone_from(&stored.deleted_by);
        self.updated_at = now.max(stored.updated_at).max(stored.created_at);
        self.updated_by = actor.to_string();
    }
}

// =============================================================================
// CONFLICT REPORTS
// =============================================================================

/// One row the store refused to overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedRow {
    /// Record type (store table) of the row.
    pub record_type: &'static str,
    /// Identity of the row.
    pub id: RecordId,
    /// Token the writer presented (`None` for unguarded writes).
    pub expected: Option<ConcurrencyToken>,
    /// Token currently stored (`None` if the row no longer exists).
    pub actual: Option<ConcurrencyToken>,
}

/// Every row flagged by the store in one rejected batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConflictSet(pub Vec<ConflictedRow>);

impl ConflictSet {
    /// Create a conflict set from flagged rows.
    #[must_use]
    pub fn new(rows: Vec<ConflictedRow>) -> Self {
        Self(rows)
    }

    /// Iterate the flagged rows.
    pub fn iter(&self) -> impl Iterator<Item = &ConflictedRow> {
        self.0.iter()
    }

    /// Number of flagged rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no rows were flagged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a specific row was flagged.
    #[must_use]
    pub fn contains(&self, record_type: &str, id: RecordId) -> bool {
        self.0
            .iter()
            .any(|row| row.record_type == record_type && row.id == id)
    }
}

impl fmt::Display for ConflictSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}#{}", row.record_type, row.id)?;
            match row.actual {
                Some(actual) => write!(f, " (now {})", actual)?,
                None => write!(f, " (gone)")?,
            }
        }
        Ok(())
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Warden data-access layer.
///
/// Store failures other than concurrency conflicts are passed through
/// without classification.
#[derive(Debug, Error)]
pub enum WardenError {
    /// A write's concurrency token no longer matches the stored row.
    ///
    /// The flagged rows have already been reloaded into the session when
    /// this reaches the caller; re-apply the change and retry.
    #[error("Concurrency conflict on {0}")]
    Conflict(ConflictSet),

    /// Illegal transaction-scope or lifecycle transition.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A required collaborator was not supplied at construction time.
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    /// An argument is outside its accepted domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A save was cancelled before reaching the store.
    #[error("Operation cancelled")]
    Cancelled,

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// The persistence store reported a failure.
    #[error("Store error: {0}")]
    StoreError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl WardenError {
    /// Whether this error is a concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// The conflict report, if this is a conflict.
    #[must_use]
    pub fn conflicts(&self) -> Option<&ConflictSet> {
        match self {
            Self::Conflict(set) => Some(set),
            _ => None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    #[test]
    fn unassigned_id_is_zero() {
        assert!(!RecordId::UNASSIGNED.is_assigned());
        assert!(RecordId(1).is_assigned());
        assert_eq!(RecordId(7).to_string(), "7");
    }

    #[test]
    fn stamp_created_sets_both_sides() {
        let mut stamp = AuditStamp {
            deleted_at: Some(at(5)),
            deleted_by: Some("mallory".into()),
            ..AuditStamp::default()
        };
        stamp.stamp_created(at(100), "alice");

        assert_eq!(stamp.created_at, at(100));
        assert_eq!(stamp.updated_at, at(100));
        assert_eq!(stamp.created_by, "alice");
        assert_eq!(stamp.updated_by, "alice");
        assert!(!stamp.is_deleted());
    }

    #[test]
    fn stamp_updated_restores_created_fields() {
        let mut stored = AuditStamp::default();
        stored.stamp_created(at(100), "alice");

        let mut incoming = AuditStamp {
            created_at: at(1),
            created_by: "forged".into(),
            ..AuditStamp::default()
        };
        incoming.stamp_updated(&stored, at(200), "bob");

        assert_eq!(incoming.created_at, at(100));
        assert_eq!(incoming.created_by, "alice");
        assert_eq!(incoming.updated_at, at(200));
        assert_eq!(incoming.updated_by, "bob");
    }

    #[test]
    fn stamp_updated_never_moves_backwards() {
        let mut stored = AuditStamp::default();
        stored.stamp_created(at(100), "alice");
        stored.updated_at = at(300);

        let mut incoming = stored.clone();
        incoming.stamp_updated(&stored, at(50), "bob");

        assert_eq!(incoming.updated_at, at(300));
    }

    #[test]
    fn conflict_set_display_lists_rows() {
        let set = ConflictSet::new(vec![
            ConflictedRow {
                record_type: "risks",
                id: RecordId(3),
                expected: Some(ConcurrencyToken(1)),
                actual: Some(ConcurrencyToken(4)),
            },
            ConflictedRow {
                record_type: "findings",
                id: RecordId(9),
                expected: None,
                actual: None,
            },
        ]);

        assert_eq!(set.to_string(), "risks#3 (now v4), findings#9 (gone)");
        assert!(set.contains("risks", RecordId(3)));
        assert!(!set.contains("risks", RecordId(9)));

        let err = WardenError::Conflict(set);
        assert!(err.is_conflict());
        assert_eq!(err.conflicts().map(ConflictSet::len), Some(2));
    }
}
