//! # Change Tracker
//!
//! Session-local pending state. Holds one entry per tracked row, keyed by
//! `(record type, id)` for persisted rows and by a staging sequence for
//! rows that do not exist in the store yet.
//!
//! Entries are type-erased (encoded payloads), so one tracker serves every
//! accessor of a session.
//!
//! ## Determinism
//!
//! `BTreeMap` keys give a fixed batch order: persisted rows by
//! (record type, id), then inserts in staging order.

use crate::store::{StoredRow, WriteOp, WriteOutcome};
use crate::{ConcurrencyToken, RecordId};
use std::collections::BTreeMap;

/// Identity of a tracker entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKey {
    /// A row that exists in the store.
    Persisted(&'static str, RecordId),
    /// A staged insert, by staging sequence.
    Pending(u64),
}

/// Pending state of a tracker entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Matches the last row seen from the store.
    Unchanged,
    /// Will be inserted.
    Added,
    /// Will be overwritten.
    Modified,
    /// Will be removed.
    Deleted,
}

#[derive(Debug, Clone)]
struct TrackedEntry {
    table: &'static str,
    state: EntryState,
    /// Last row seen from the store, if any.
    original: Option<StoredRow>,
    /// Payload to write.
    current: Vec<u8>,
    /// Token the write is guarded by (`None`: last write wins).
    expected: Option<ConcurrencyToken>,
}

impl TrackedEntry {
    fn unchanged(table: &'static str, row: StoredRow) -> Self {
        Self {
            table,
            state: EntryState::Unchanged,
            current: row.payload.clone(),
            expected: Some(row.token),
            original: Some(row),
        }
    }
}

/// Pending changes of one session.
#[derive(Debug, Default)]
pub(crate) struct ChangeTracker {
    entries: BTreeMap<EntryKey, TrackedEntry>,
    next_pending: u64,
}

impl ChangeTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attach a row returned by a read.
    ///
    /// Entries with pending changes are left alone.
    pub(crate) fn track_loaded(&mut self, table: &'static str, row: &StoredRow) {
        let key = EntryKey::Persisted(table, row.id);
        let pending = self
            .entries
            .get(&key)
            .is_some_and(|e| e.state != EntryState::Unchanged);
        if !pending {
            self.entries
                .insert(key, TrackedEntry::unchanged(table, row.clone()));
        }
    }

    /// Last row seen from the store for a tracked record.
    pub(crate) fn original(&self, table: &'static str, id: RecordId) -> Option<&StoredRow> {
        self.entries
            .get(&EntryKey::Persisted(table, id))
            .and_then(|e| e.original.as_ref())
    }

    pub(crate) fn stage_insert(&mut self, table: &'static str, payload: Vec<u8>) -> EntryKey {
        let key = EntryKey::Pending(self.next_pending);
        self.next_pending = self.next_pending.saturating_add(1);
        self.entries.insert(
            key,
            TrackedEntry {
                table,
                state: EntryState::Added,
                original: None,
                current: payload,
                expected: None,
            },
        );
        key
    }

    pub(crate) fn stage_update(
        &mut self,
        table: &'static str,
        id: RecordId,
        payload: Vec<u8>,
        expected: Option<ConcurrencyToken>,
    ) -> EntryKey {
        let key = EntryKey::Persisted(table, id);
        let original = self.entries.remove(&key).and_then(|e| e.original);
        self.entries.insert(
            key,
            TrackedEntry {
                table,
                state: EntryState::Modified,
                original,
                current: payload,
                expected,
            },
        );
        key
    }

    pub(crate) fn stage_delete(&mut self, table: &'static str, id: RecordId) -> EntryKey {
        let key = EntryKey::Persisted(table, id);
        let entry = self.entries.entry(key).or_insert_with(|| TrackedEntry {
            table,
            state: EntryState::Deleted,
            original: None,
            current: Vec::new(),
            expected: None,
        });
        entry.state = EntryState::Deleted;
        key
    }

    /// Demote guarded updates that would rewrite the stored row unchanged.
    pub(crate) fn detect_changes(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.state != EntryState::Modified {
                continue;
            }
            let Some(original) = &entry.original else {
                continue;
            };
            if entry.expected == Some(original.token) && entry.current == original.payload {
                entry.state = EntryState::Unchanged;
            }
        }
    }

    /// Every pending change as one ordered batch.
    pub(crate) fn build_batch(&self) -> (Vec<EntryKey>, Vec<WriteOp>) {
        let mut keys = Vec::new();
        let mut ops = Vec::new();
        for (key, entry) in &self.entries {
            let op = match (entry.state, key) {
                (EntryState::Unchanged, _) => continue,
                (EntryState::Added, _) => WriteOp::Insert {
                    table: entry.table,
                    payload: entry.current.clone(),
                },
                (EntryState::Modified, EntryKey::Persisted(_, id)) => WriteOp::Update {
                    table: entry.table,
                    id: *id,
                    expected: entry.expected,
                    payload: entry.current.clone(),
                },
                (EntryState::Deleted, EntryKey::Persisted(_, id)) => WriteOp::Delete {
                    table: entry.table,
                    id: *id,
                },
                // Staged inserts are only ever Added.
                (_, EntryKey::Pending(_)) => continue,
            };
            keys.push(*key);
            ops.push(op);
        }
        (keys, ops)
    }

    /// Record the store's outcome for one flushed entry.
    ///
    /// With `keep_tracking` the entry becomes `Unchanged` against the row
    /// just written; otherwise it is detached.
    pub(crate) fn accept(&mut self, key: EntryKey, outcome: WriteOutcome, keep_tracking: bool) {
        let Some(entry) = self.entries.remove(&key) else {
            return;
        };
        let (id, token) = match (outcome, key) {
            (WriteOutcome::Inserted { id, token }, _) => (id, token),
            (WriteOutcome::Updated { token }, EntryKey::Persisted(_, id)) => (id, token),
            _ => return,
        };
        if keep_tracking {
            let row = StoredRow {
                id,
                token,
                payload: entry.current,
            };
            self.entries.insert(
                EntryKey::Persisted(entry.table, id),
                TrackedEntry::unchanged(entry.table, row),
            );
        }
    }

    /// Replace an entry with the store's current row, or forget it if gone.
    ///
    /// Pending changes on the entry are discarded.
    pub(crate) fn refresh(&mut self, table: &'static str, id: RecordId, row: Option<StoredRow>) {
        let key = EntryKey::Persisted(table, id);
        match row {
            Some(row) => {
                self.entries.insert(key, TrackedEntry::unchanged(table, row));
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    /// Undo the pending changes of a batch the store rejected.
    ///
    /// Staged inserts are dropped. Updates and deletes fall back to the
    /// last row seen from the store, or are forgotten if none was seen.
    pub(crate) fn discard(&mut self, keys: &[EntryKey]) {
        for key in keys {
            let Some(entry) = self.entries.remove(key) else {
                continue;
            };
            if let (EntryKey::Persisted(..), Some(original)) = (key, entry.original) {
                self.entries
                    .insert(*key, TrackedEntry::unchanged(entry.table, original));
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn has_changes(&self) -> bool {
        self.entries
            .values()
            .any(|e| e.state != EntryState::Unchanged)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// State of one entry.
    pub(crate) fn state(&self, key: EntryKey) -> Option<EntryState> {
        self.entries.get(&key).map(|e| e.state)
    }
}
