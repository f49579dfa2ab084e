//! # Record Contracts
//!
//! Every persisted record satisfies `Identifiable`. Records that carry
//! provenance and a concurrency token also satisfy `Auditable`.
//!
//! The `identifiable_record!` and `auditable_record!` macros implement the
//! contracts for structs with an `id: RecordId` field (and an
//! `audit: AuditStamp` field), so a new record type costs one line.
//!
//! ## Row Codec
//!
//! Records are stored as postcard payloads. Identity and concurrency token
//! live in the store's row metadata, not in the payload: `encode` blanks
//! the id and `decode` restores both from the row.

use crate::store::StoredRow;
use crate::{AuditStamp, ConcurrencyToken, RecordId, WardenError};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A persisted record with a store-assigned numeric identity.
pub trait Identifiable: Clone + Serialize + DeserializeOwned + 'static {
    /// Store table holding this record type. Unique per type.
    const RECORD_TYPE: &'static str;

    /// Store-assigned identity (`RecordId::UNASSIGNED` before creation).
    fn id(&self) -> RecordId;

    /// Overwrite the identity. Only the layer calls this.
    fn set_id(&mut self, id: RecordId);

    /// Provenance, for records that carry it.
    fn audit_stamp(&self) -> Option<&AuditStamp> {
        None
    }

    /// Mutable provenance, for records that carry it.
    fn audit_stamp_mut(&mut self) -> Option<&mut AuditStamp> {
        None
    }
}

/// A record with creation/modification provenance and a concurrency token.
pub trait Auditable: Identifiable {
    /// Provenance of this record.
    fn audit(&self) -> &AuditStamp;

    /// Mutable provenance of this record.
    fn audit_mut(&mut self) -> &mut AuditStamp;

    /// Token of the row this copy was read from.
    fn concurrency_token(&self) -> ConcurrencyToken {
        self.audit().concurrency_token
    }

    /// Whether this copy carries a tombstone.
    fn is_deleted(&self) -> bool {
        self.audit().is_deleted()
    }
}

/// Implement `Identifiable` for a struct with an `id: RecordId` field.
///
/// ```ignore
/// identifiable_record!(RiskCategory, "risk_categories");
/// ```
#[macro_export]
macro_rules! identifiable_record {
    ($ty:ty, $table:literal) => {
        impl $crate::Identifiable for $ty {
            const RECORD_TYPE: &'static str = $table;

            fn id(&self) -> $crate::RecordId {
                self.id
            }

            fn set_id(&mut self, id: $crate::RecordId) {
                self.id = id;
            }
        }
    };
}

/// Implement `Identifiable` and `Auditable` for a struct with
/// `id: RecordId` and `audit: AuditStamp` fields.
///
/// ```ignore
/// auditable_record!(Risk, "risks");
/// ```
#[macro_export]
macro_rules! auditable_record {
    ($ty:ty, $table:literal) => {
        impl $crate::Identifiable for $ty {
            const RECORD_TYPE: &'static str = $table;

            fn id(&self) -> $crate::RecordId {
                self.id
            }

            fn set_id(&mut self, id: $crate::RecordId) {
                self.id = id;
            }

            fn audit_stamp(&self) -> Option<&$crate::AuditStamp> {
                Some(&self.audit)
            }

            fn audit_stamp_mut(&mut self) -> Option<&mut $crate::AuditStamp> {
                Some(&mut self.audit)
            }
        }

        impl $crate::Auditable for $ty {
            fn audit(&self) -> &$crate::AuditStamp {
                &self.audit
            }

            fn audit_mut(&mut self) -> &mut $crate::AuditStamp {
                &mut self.audit
            }
        }
    };
}

/// Whether a record carries a tombstone. Always false for plain records.
pub(crate) fn is_tombstoned<T: Identifiable>(record: &T) -> bool {
    record.audit_stamp().is_some_and(AuditStamp::is_deleted)
}

// =============================================================================
// ROW CODEC
// =============================================================================

/// Encode a record as a row payload.
///
/// The id is blanked so that re-encoding a decoded record reproduces the
/// stored bytes exactly.
pub fn encode<T: Identifiable>(record: &T) -> Result<Vec<u8>, WardenError> {
    let mut normalized = record.clone();
    normalized.set_id(RecordId::UNASSIGNED);
    postcard::to_allocvec(&normalized).map_err(|e| WardenError::SerializationError(e.to_string()))
}

/// Decode a stored row, restoring identity and token from row metadata.
pub fn decode<T: Identifiable>(row: &StoredRow) -> Result<T, WardenError> {
    let mut record: T = postcard::from_bytes(&row.payload)
        .map_err(|e| WardenError::DeserializationError(format!("{}: {}", T::RECORD_TYPE, e)))?;
    record.set_id(row.id);
    if let Some(stamp) = record.audit_stamp_mut() {
        stamp.concurrency_token = row.token;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tag {
        id: RecordId,
        label: String,
    }
    crate::identifiable_record!(Tag, "tags");

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: RecordId,
        body: String,
        audit: AuditStamp,
    }
    crate::auditable_record!(Note, "notes");

    #[test]
    fn decode_restores_row_metadata() {
        let note = Note {
            id: RecordId(99),
            body: "hello".into(),
            audit: AuditStamp::default(),
        };
        let row = StoredRow {
            id: RecordId(4),
            token: ConcurrencyToken(17),
            payload: encode(&note).expect("encode"),
        };

        let back: Note = decode(&row).expect("decode");
        assert_eq!(back.id, RecordId(4));
        assert_eq!(back.concurrency_token(), ConcurrencyToken(17));
        assert_eq!(back.body, "hello");
    }

    #[test]
    fn encoding_ignores_identity() {
        let a = Tag {
            id: RecordId(1),
            label: "x".into(),
        };
        let b = Tag {
            id: RecordId(2),
            label: "x".into(),
        };
        assert_eq!(encode(&a).expect("encode"), encode(&b).expect("encode"));
    }

    #[test]
    fn plain_records_have_no_stamp() {
        let tag = Tag {
            id: RecordId(1),
            label: "x".into(),
        };
        assert!(tag.audit_stamp().is_none());
        assert!(!is_tombstoned(&tag));
        assert_eq!(Tag::RECORD_TYPE, "tags");
    }

    #[test]
    fn garbage_payload_is_deserialization_error() {
        let row = StoredRow {
            id: RecordId(1),
            token: ConcurrencyToken(1),
            payload: vec![0xff, 0xff, 0xff],
        };
        let result: Result<Note, _> = decode(&row);
        assert!(matches!(result, Err(WardenError::DeserializationError(_))));
    }
}
