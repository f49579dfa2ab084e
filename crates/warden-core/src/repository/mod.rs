//! # Accessors
//!
//! Generic per-record-type CRUD, query, paging and bulk operations.
//!
//! - `BasicRepository<T: Identifiable>`: caller owns every field, last
//!   write wins.
//! - `AuditableRepository<T: Auditable>`: stamps provenance and guards
//!   every update with the caller's concurrency token.
//!
//! Accessors are thin handles on the session's `DataContext`. Mutating
//! calls stage their change and save immediately (one store round-trip);
//! bulk calls stage many changes and save once. The `stage_*` variants
//! only stage, leaving the flush to `Session::save_changes` or
//! `Session::commit_transaction`.

mod auditable;
mod basic;

pub use auditable::AuditableRepository;
pub use basic::BasicRepository;

use crate::context::{DataContext, SaveReport};
use crate::record::{Identifiable, decode, is_tombstoned};
use crate::tracker::{EntryKey, EntryState};
use crate::{RecordId, WardenError};

/// Point read, honoring tombstones and the session's tracking option.
pub(crate) fn fetch<T: Identifiable>(
    ctx: &DataContext,
    id: RecordId,
    with_deleted: bool,
) -> Result<Option<T>, WardenError> {
    let Some(row) = ctx.get(T::RECORD_TYPE, id)? else {
        return Ok(None);
    };
    let record: T = decode(&row)?;
    if !with_deleted && is_tombstoned(&record) {
        return Ok(None);
    }
    if ctx.options().track_queries {
        ctx.track(T::RECORD_TYPE, [&row]);
    }
    Ok(Some(record))
}

/// Copy the identity and token a save assigned back onto the caller's copy.
///
/// A guarded update that would rewrite the stored row unchanged is dropped
/// by change detection; the caller's copy is then already current.
pub(crate) fn apply_saved<T: Identifiable>(
    ctx: &DataContext,
    report: &SaveReport,
    key: EntryKey,
    record: &mut T,
) -> Result<(), WardenError> {
    let Some(token) = report.token(key) else {
        return match ctx.entry_state(key) {
            Some(EntryState::Unchanged) => Ok(()),
            _ => Err(WardenError::InvalidState(format!(
                "{} write was not part of the flushed batch",
                T::RECORD_TYPE
            ))),
        };
    };
    if let Some(id) = report.assigned_id(key) {
        record.set_id(id);
    }
    if let Some(stamp) = record.audit_stamp_mut() {
        stamp.concurrency_token = token;
    }
    Ok(())
}

/// Count the deletes in a report whose rows existed.
pub(crate) fn count_existed(report: &SaveReport, keys: &[EntryKey]) -> usize {
    keys.iter()
        .filter(|key| report.existed(**key) == Some(true))
        .count()
}
