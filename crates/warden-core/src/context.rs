//! # Data Context
//!
//! The state one session shares with all of its accessors: the store, the
//! change tracker, the clock and the session options.
//!
//! `DataContext` is a cheap `Rc` handle. The session is single-flow, so
//! interior mutability is a `RefCell`; no method holds a borrow across a
//! call into another method of this type.
//!
//! ## Save
//!
//! `save` is the one place writes reach the store. A rejected batch is
//! discarded from the tracker as a whole. On a concurrency conflict every
//! row the store flagged is then reloaded before the error is re-raised.

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::config::SessionOptions;
use crate::store::{RecordStore, StoredRow, WriteOutcome};
use crate::tracker::{ChangeTracker, EntryKey, EntryState};
use crate::{ConcurrencyToken, RecordId, WardenError};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

// =============================================================================
// SAVE REPORT
// =============================================================================

/// What one save wrote, per flushed tracker entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    outcomes: BTreeMap<EntryKey, WriteOutcome>,
}

impl SaveReport {
    /// Outcome of a flushed entry.
    #[must_use]
    pub fn outcome(&self, key: EntryKey) -> Option<WriteOutcome> {
        self.outcomes.get(&key).copied()
    }

    /// Identity the store assigned to a staged insert.
    #[must_use]
    pub fn assigned_id(&self, key: EntryKey) -> Option<RecordId> {
        match self.outcome(key)? {
            WriteOutcome::Inserted { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Token of the row written for an entry.
    #[must_use]
    pub fn token(&self, key: EntryKey) -> Option<ConcurrencyToken> {
        match self.outcome(key)? {
            WriteOutcome::Inserted { token, .. } | WriteOutcome::Updated { token } => Some(token),
            WriteOutcome::Deleted { .. } => None,
        }
    }

    /// Whether a deleted entry's row existed.
    #[must_use]
    pub fn existed(&self, key: EntryKey) -> Option<bool> {
        match self.outcome(key)? {
            WriteOutcome::Deleted { existed } => Some(existed),
            _ => None,
        }
    }

    /// Number of writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Iterate (entry, outcome) pairs in batch order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntryKey, &WriteOutcome)> {
        self.outcomes.iter()
    }
}

// =============================================================================
// DATA CONTEXT
// =============================================================================

#[derive(Debug)]
struct ContextState {
    store: Box<dyn RecordStore>,
    tracker: ChangeTracker,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
    /// Change detection and post-save tracking; off during bulk saves.
    auto_detect: bool,
}

/// Shared handle on one session's store and pending state.
#[derive(Debug, Clone)]
pub(crate) struct DataContext(Rc<RefCell<ContextState>>);

impl DataContext {
    pub(crate) fn new(
        store: Box<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        options: SessionOptions,
    ) -> Self {
        Self(Rc::new(RefCell::new(ContextState {
            store,
            tracker: ChangeTracker::new(),
            clock,
            auto_detect: options.auto_detect_changes,
            options,
        })))
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.0.borrow().clock.now()
    }

    pub(crate) fn options(&self) -> SessionOptions {
        self.0.borrow().options
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub(crate) fn get(&self, table: &str, id: RecordId) -> Result<Option<StoredRow>, WardenError> {
        self.0.borrow().store.get(table, id)
    }

    pub(crate) fn scan(&self, table: &str) -> Result<Vec<StoredRow>, WardenError> {
        self.0.borrow().store.scan(table)
    }

    pub(crate) fn count(&self, table: &str) -> Result<usize, WardenError> {
        self.0.borrow().store.count(table)
    }

    /// Attach rows returned by a read as `Unchanged`.
    pub(crate) fn track<'a>(
        &self,
        table: &'static str,
        rows: impl IntoIterator<Item = &'a StoredRow>,
    ) {
        let mut state = self.0.borrow_mut();
        for row in rows {
            state.tracker.track_loaded(table, row);
        }
    }

    /// The tracked snapshot of a row, or a fresh read if it is not tracked.
    pub(crate) fn original_or_fetch(
        &self,
        table: &'static str,
        id: RecordId,
    ) -> Result<Option<StoredRow>, WardenError> {
        let state = self.0.borrow();
        match state.tracker.original(table, id) {
            Some(row) => Ok(Some(row.clone())),
            None => state.store.get(table, id),
        }
    }

    /// Re-read a row and replace its tracker entry.
    pub(crate) fn reload(
        &self,
        table: &'static str,
        id: RecordId,
    ) -> Result<Option<StoredRow>, WardenError> {
        let mut state = self.0.borrow_mut();
        let fresh = state.store.get(table, id)?;
        state.tracker.refresh(table, id, fresh.clone());
        Ok(fresh)
    }

    // -------------------------------------------------------------------------
    // Staging
    // -------------------------------------------------------------------------

    pub(crate) fn stage_insert(&self, table: &'static str, payload: Vec<u8>) -> EntryKey {
        self.0.borrow_mut().tracker.stage_insert(table, payload)
    }

    pub(crate) fn stage_update(
        &self,
        table: &'static str,
        id: RecordId,
        payload: Vec<u8>,
        expected: Option<ConcurrencyToken>,
    ) -> EntryKey {
        self.0
            .borrow_mut()
            .tracker
            .stage_update(table, id, payload, expected)
    }

    pub(crate) fn stage_delete(&self, table: &'static str, id: RecordId) -> EntryKey {
        self.0.borrow_mut().tracker.stage_delete(table, id)
    }

    /// Drop staged entries that will not be saved.
    pub(crate) fn discard(&self, keys: &[EntryKey]) {
        self.0.borrow_mut().tracker.discard(keys);
    }

    // -------------------------------------------------------------------------
    // Save
    // -------------------------------------------------------------------------

    /// Flush every pending change in one batch.
    pub(crate) fn save(&self, cancel: Option<&CancelSignal>) -> Result<SaveReport, WardenError> {
        let mut guard = self.0.borrow_mut();
        let state = &mut *guard;

        if state.auto_detect {
            state.tracker.detect_changes();
        }
        let (keys, ops) = state.tracker.build_batch();
        if ops.is_empty() {
            return Ok(SaveReport::default());
        }
        if cancel.is_some_and(CancelSignal::is_cancelled) {
            tracing::debug!(target: "warden::session", pending = ops.len(), "save cancelled");
            return Err(WardenError::Cancelled);
        }

        tracing::debug!(
            target: "warden::session",
            writes = ops.len(),
            in_transaction = state.store.in_transaction(),
            "flushing pending changes"
        );
        match state.store.apply(&ops) {
            Ok(outcomes) => {
                let mut report = SaveReport::default();
                for (key, outcome) in keys.into_iter().zip(outcomes) {
                    state.tracker.accept(key, outcome, state.auto_detect);
                    report.outcomes.insert(key, outcome);
                }
                Ok(report)
            }
            Err(WardenError::Conflict(set)) => {
                tracing::debug!(
                    target: "warden::session",
                    conflicts = %set,
                    "store rejected batch; reloading flagged rows"
                );
                state.tracker.discard(&keys);
                for row in set.iter() {
                    let fresh = state.store.get(row.record_type, row.id)?;
                    state.tracker.refresh(row.record_type, row.id, fresh);
                }
                Err(WardenError::Conflict(set))
            }
            Err(e) => {
                tracing::debug!(target: "warden::session", error = %e, "store rejected batch");
                state.tracker.discard(&keys);
                Err(e)
            }
        }
    }

    /// Toggle change detection; returns the previous setting.
    pub(crate) fn set_auto_detect(&self, enabled: bool) -> bool {
        std::mem::replace(&mut self.0.borrow_mut().auto_detect, enabled)
    }

    // -------------------------------------------------------------------------
    // Transactions & tracker housekeeping
    // -------------------------------------------------------------------------

    pub(crate) fn begin_transaction(&self) -> Result<(), WardenError> {
        self.0.borrow_mut().store.begin_transaction()
    }

    pub(crate) fn commit_transaction(&self) -> Result<(), WardenError> {
        self.0.borrow_mut().store.commit_transaction()
    }

    /// Roll back the store and detach everything tracked.
    pub(crate) fn rollback_transaction(&self) -> Result<(), WardenError> {
        let mut state = self.0.borrow_mut();
        state.tracker.clear();
        state.store.rollback_transaction()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.0.borrow().store.in_transaction()
    }

    pub(crate) fn detach_all(&self) {
        self.0.borrow_mut().tracker.clear();
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.0.borrow().tracker.has_changes()
    }

    pub(crate) fn tracked_count(&self) -> usize {
        self.0.borrow().tracker.len()
    }

    pub(crate) fn entry_state(&self, key: EntryKey) -> Option<EntryState> {
        self.0.borrow().tracker.state(key)
    }
}
