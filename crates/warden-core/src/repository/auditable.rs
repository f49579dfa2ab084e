//! # Auditable Accessor
//!
//! CRUD, query, paging and bulk operations for `Auditable` records.
//!
//! ## Provenance
//!
//! - create: `created_* = updated_* = (now, actor)`, tombstone cleared
//! - update: `created_*` and tombstone copied from the stored row,
//!   `updated_at = max(now, stored.updated_at)`, `updated_by = actor`
//!
//! Caller-supplied provenance is overwritten in both cases.
//!
//! ## Concurrency
//!
//! Every update and soft delete is guarded by the token on the caller's
//! copy. The store compares it; a mismatch surfaces as
//! `WardenError::Conflict` after the session reloaded the flagged rows.
//!
//! ## Soft Delete
//!
//! `soft_delete` writes a tombstone (`deleted_at`, `deleted_by`). Reads skip
//! tombstoned records unless the query asks `with_deleted()`; `restore`
//! clears the tombstone. `delete` / `delete_many` remove rows.

use super::{apply_saved, count_existed, fetch};
use crate::context::DataContext;
use crate::query::{Include, Loaded, Page, Query};
use crate::record::{Auditable, decode, encode};
use crate::tracker::EntryKey;
use crate::{AuditStamp, RecordId, WardenError};
use std::fmt;
use std::marker::PhantomData;

/// Generic accessor for one auditable record type.
pub struct AuditableRepository<T: Auditable> {
    ctx: DataContext,
    _record: PhantomData<fn() -> T>,
}

impl<T: Auditable> fmt::Debug for AuditableRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditableRepository")
            .field("record_type", &T::RECORD_TYPE)
            .finish()
    }
}

impl<T: Auditable> AuditableRepository<T> {
    pub(crate) fn new(ctx: DataContext) -> Self {
        Self {
            ctx,
            _record: PhantomData,
        }
    }

    /// Stored provenance of a record, from the tracker snapshot or the store.
    fn stored_stamp(&self, id: RecordId) -> Result<Option<AuditStamp>, WardenError> {
        self.ctx
            .original_or_fetch(T::RECORD_TYPE, id)?
            .map(|row| decode::<T>(&row).map(|stored| stored.audit().clone()))
            .transpose()
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Every live record, in id order.
    pub fn get_all(&self) -> Result<Vec<T>, WardenError> {
        self.query().to_vec()
    }

    /// One live record, or `None` if absent or tombstoned.
    pub fn get_by_id(&self, id: RecordId) -> Result<Option<T>, WardenError> {
        fetch(&self.ctx, id, false)
    }

    /// Live records matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Result<Vec<T>, WardenError> {
        self.query().filter(predicate).to_vec()
    }

    /// First live record (by id) matching `predicate`.
    pub fn first_or_default(
        &self,
        predicate: impl Fn(&T) -> bool,
    ) -> Result<Option<T>, WardenError> {
        self.query().filter(predicate).first()
    }

    /// Whether any live record matches `predicate`.
    pub fn exists(&self, predicate: impl Fn(&T) -> bool) -> Result<bool, WardenError> {
        self.query().filter(predicate).as_no_tracking().any()
    }

    /// Number of live records.
    pub fn count(&self) -> Result<usize, WardenError> {
        self.query().as_no_tracking().count()
    }

    /// Number of live records matching `predicate`.
    pub fn count_where(&self, predicate: impl Fn(&T) -> bool) -> Result<usize, WardenError> {
        self.query().filter(predicate).as_no_tracking().count()
    }

    /// One record with its relations loaded.
    pub fn get_by_id_with_includes(
        &self,
        id: RecordId,
        includes: &[Include<T>],
    ) -> Result<Option<Loaded<T>>, WardenError> {
        Ok(self
            .query_with_includes(includes)
            .for_id(id)
            .load()?
            .into_iter()
            .next())
    }

    /// Every live record with its relations loaded.
    pub fn get_all_with_includes(
        &self,
        includes: &[Include<T>],
    ) -> Result<Vec<Loaded<T>>, WardenError> {
        self.query_with_includes(includes).load()
    }

    /// Matching records with their relations loaded.
    pub fn find_with_includes(
        &self,
        predicate: impl Fn(&T) -> bool,
        includes: &[Include<T>],
    ) -> Result<Vec<Loaded<T>>, WardenError> {
        self.query_with_includes(includes).filter(predicate).load()
    }

    // =========================================================================
    // PAGING
    // =========================================================================

    /// Page `page` (1-based) of every live record, in id order.
    pub fn get_paged(&self, page: usize, page_size: usize) -> Result<Page<T>, WardenError> {
        self.query().page(page, page_size)
    }

    /// Page of the live records matching `predicate`, in id order.
    pub fn get_paged_where(
        &self,
        predicate: impl Fn(&T) -> bool,
        page: usize,
        page_size: usize,
    ) -> Result<Page<T>, WardenError> {
        self.query().filter(predicate).page(page, page_size)
    }

    /// Page of the matching records sorted by `key`. Ties keep id order.
    pub fn get_paged_sorted<K: Ord>(
        &self,
        predicate: impl Fn(&T) -> bool,
        key: impl Fn(&T) -> K,
        ascending: bool,
        page: usize,
        page_size: usize,
    ) -> Result<Page<T>, WardenError> {
        self.query()
            .filter(predicate)
            .order_by(key, ascending)
            .page(page, page_size)
    }

    // =========================================================================
    // ESCAPE HATCH
    // =========================================================================

    /// Composable query over the live records of this type.
    pub fn query<'q>(&self) -> Query<'q, T> {
        Query::new(self.ctx.clone())
    }

    /// Composable query with relations pre-registered for `load`.
    pub fn query_with_includes<'q>(&self, includes: &[Include<T>]) -> Query<'q, T> {
        includes
            .iter()
            .cloned()
            .fold(self.query(), |query, include| query.include(include))
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Stamp and persist a new record, returned with its identity and token.
    pub fn create(&self, mut entity: T, actor: &str) -> Result<T, WardenError> {
        let key = self.stage_create(&mut entity, actor)?;
        let report = self.ctx.save(None)?;
        apply_saved(&self.ctx, &report, key, &mut entity)?;
        Ok(entity)
    }

    /// Stamp and persist an update, guarded by the copy's token.
    pub fn update(&self, mut entity: T, actor: &str) -> Result<T, WardenError> {
        let key = self.stage_update(&mut entity, actor)?;
        let report = self.ctx.save(None)?;
        apply_saved(&self.ctx, &report, key, &mut entity)?;
        Ok(entity)
    }

    /// Stamp and persist many new records in one store write.
    pub fn create_many(&self, mut entities: Vec<T>, actor: &str) -> Result<Vec<T>, WardenError> {
        let keys = self.stage_all(&mut entities, |e| self.stage_create(e, actor))?;
        let report = self.ctx.save(None)?;
        for (entity, key) in entities.iter_mut().zip(keys) {
            apply_saved(&self.ctx, &report, key, entity)?;
        }
        Ok(entities)
    }

    /// Stamp and persist many updates in one store write.
    ///
    /// One stale token rejects the whole batch, and none of it stays
    /// pending.
    pub fn update_many(&self, mut entities: Vec<T>, actor: &str) -> Result<Vec<T>, WardenError> {
        let keys = self.stage_all(&mut entities, |e| self.stage_update(e, actor))?;
        let report = self.ctx.save(None)?;
        for (entity, key) in entities.iter_mut().zip(keys) {
            apply_saved(&self.ctx, &report, key, entity)?;
        }
        Ok(entities)
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub fn delete(&self, id: RecordId) -> Result<bool, WardenError> {
        let key = self.stage_delete(id);
        let report = self.ctx.save(None)?;
        Ok(report.existed(key) == Some(true))
    }

    /// Remove every record matching `predicate`, tombstoned ones included.
    pub fn delete_many(&self, predicate: impl Fn(&T) -> bool) -> Result<usize, WardenError> {
        let ids: Vec<RecordId> = self
            .query()
            .with_deleted()
            .as_no_tracking()
            .filter(predicate)
            .to_vec()?
            .iter()
            .map(|e| e.id())
            .collect();
        let keys: Vec<EntryKey> = ids.into_iter().map(|id| self.stage_delete(id)).collect();
        let report = self.ctx.save(None)?;
        Ok(count_existed(&report, &keys))
    }

    /// Tombstone a record. Returns `false` if absent or already tombstoned.
    pub fn soft_delete(&self, id: RecordId, actor: &str) -> Result<bool, WardenError> {
        let Some(stored) = fetch::<T>(&self.ctx, id, true)? else {
            return Ok(false);
        };
        if stored.is_deleted() {
            return Ok(false);
        }
        self.stage_tombstone(stored, actor, true)?;
        self.ctx.save(None)?;
        Ok(true)
    }

    /// Tombstone every live record matching `predicate` in one store write.
    pub fn soft_delete_many(
        &self,
        predicate: impl Fn(&T) -> bool,
        actor: &str,
    ) -> Result<usize, WardenError> {
        let live = self.query().filter(predicate).to_vec()?;
        let keys = live
            .into_iter()
            .map(|record| self.stage_tombstone(record, actor, true))
            .collect::<Result<Vec<_>, _>>()?;
        let report = self.ctx.save(None)?;
        Ok(keys
            .iter()
            .filter(|key| report.token(**key).is_some())
            .count())
    }

    /// Clear a tombstone. Returns `false` if absent or not tombstoned.
    pub fn restore(&self, id: RecordId, actor: &str) -> Result<bool, WardenError> {
        let Some(stored) = fetch::<T>(&self.ctx, id, true)? else {
            return Ok(false);
        };
        if !stored.is_deleted() {
            return Ok(false);
        }
        self.stage_tombstone(stored, actor, false)?;
        self.ctx.save(None)?;
        Ok(true)
    }

    // =========================================================================
    // STAGING (flushed by the session)
    // =========================================================================

    /// Stamp creation provenance and stage an insert without saving.
    pub fn stage_create(&self, entity: &mut T, actor: &str) -> Result<EntryKey, WardenError> {
        entity.audit_mut().stamp_created(self.ctx.now(), actor);
        entity.set_id(RecordId::UNASSIGNED);
        Ok(self.ctx.stage_insert(T::RECORD_TYPE, encode(entity)?))
    }

    /// Stamp update provenance and stage a guarded overwrite without saving.
    ///
    /// If the record is gone the stamp falls back to the copy's own
    /// `created_*`; the store then rejects the write as a conflict.
    pub fn stage_update(&self, entity: &mut T, actor: &str) -> Result<EntryKey, WardenError> {
        let stored = self
            .stored_stamp(entity.id())?
            .unwrap_or_else(|| entity.audit().clone());
        entity
            .audit_mut()
            .stamp_updated(&stored, self.ctx.now(), actor);
        let expected = Some(entity.concurrency_token());
        Ok(self
            .ctx
            .stage_update(T::RECORD_TYPE, entity.id(), encode(entity)?, expected))
    }

    /// Stage a delete without saving.
    pub fn stage_delete(&self, id: RecordId) -> EntryKey {
        self.ctx.stage_delete(T::RECORD_TYPE, id)
    }

    /// Stage every entity, or none of them if one fails to stage.
    fn stage_all(
        &self,
        entities: &mut [T],
        stage: impl Fn(&mut T) -> Result<EntryKey, WardenError>,
    ) -> Result<Vec<EntryKey>, WardenError> {
        let mut keys = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            match stage(entity) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    self.ctx.discard(&keys);
                    return Err(e);
                }
            }
        }
        Ok(keys)
    }

    /// Stage a tombstone write (or its removal) guarded by the record's token.
    fn stage_tombstone(
        &self,
        mut record: T,
        actor: &str,
        tombstone: bool,
    ) -> Result<EntryKey, WardenError> {
        let stored = record.audit().clone();
        let stamp = record.audit_mut();
        stamp.stamp_updated(&stored, self.ctx.now(), actor);
        if tombstone {
            stamp.deleted_at = Some(stamp.updated_at);
            stamp.deleted_by = Some(actor.to_string());
        } else {
            stamp.deleted_at = None;
            stamp.deleted_by = None;
        }
        let expected = Some(record.concurrency_token());
        Ok(self
            .ctx
            .stage_update(T::RECORD_TYPE, record.id(), encode(&record)?, expected))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::SessionOptions;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Duration, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Memo {
        id: RecordId,
        body: String,
        parent: Option<RecordId>,
        audit: AuditStamp,
    }
    crate::auditable_record!(Memo, "memos");

    fn memo(body: &str) -> Memo {
        Memo {
            id: RecordId::UNASSIGNED,
            body: body.to_string(),
            parent: None,
            audit: AuditStamp::default(),
        }
    }

    fn setup() -> (AuditableRepository<Memo>, Arc<ManualClock>) {
        let start = DateTime::<Utc>::UNIX_EPOCH + Duration::days(20_000);
        let clock = Arc::new(ManualClock::new(start));
        let ctx = DataContext::new(
            Box::new(MemoryStore::new()),
            clock.clone(),
            SessionOptions::default(),
        );
        (AuditableRepository::new(ctx), clock)
    }

    #[test]
    fn create_stamps_both_sides_and_overwrites_forgeries() {
        let (repo, clock) = setup();
        let mut forged = memo("hello");
        forged.audit.created_by = "mallory".into();
        forged.audit.created_at = DateTime::<Utc>::UNIX_EPOCH;

        let created = repo.create(forged, "alice").unwrap();
        assert_eq!(created.id, RecordId(1));
        assert_eq!(created.audit.created_by, "alice");
        assert_eq!(created.audit.updated_by, "alice");
        assert_eq!(created.audit.created_at, clock.now());
        assert_eq!(created.audit.updated_at, created.audit.created_at);
        assert_ne!(created.concurrency_token(), Default::default());
    }

    #[test]
    fn update_keeps_creation_provenance() {
        let (repo, clock) = setup();
        let created = repo.create(memo("v1"), "alice").unwrap();
        clock.advance(Duration::minutes(5));

        let mut edit = created.clone();
        edit.body = "v2".into();
        edit.audit.created_by = "bob".into();
        let updated = repo.update(edit, "bob").unwrap();

        assert_eq!(updated.audit.created_by, "alice");
        assert_eq!(updated.audit.created_at, created.audit.created_at);
        assert_eq!(updated.audit.updated_by, "bob");
        assert_eq!(updated.audit.updated_at, clock.now());
        assert_ne!(updated.concurrency_token(), created.concurrency_token());
    }

    #[test]
    fn stale_copy_conflicts_and_store_keeps_first_write() {
        let (repo, _clock) = setup();
        let created = repo.create(memo("v1"), "alice").unwrap();
        let mut c1 = repo.get_by_id(created.id).unwrap().unwrap();
        let mut c2 = repo.get_by_id(created.id).unwrap().unwrap();

        c1.body = "from c1".into();
        repo.update(c1, "alice").unwrap();

        c2.body = "from c2".into();
        let err = repo.update(c2, "bob").unwrap_err();
        assert!(err.conflicts().unwrap().contains("memos", created.id));
        assert_eq!(
            repo.get_by_id(created.id).unwrap().unwrap().body,
            "from c1"
        );
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let (repo, clock) = setup();
        let created = repo.create(memo("v1"), "alice").unwrap();
        clock.advance(Duration::hours(-3));

        let mut edit = created.clone();
        edit.body = "v2".into();
        let updated = repo.update(edit, "bob").unwrap();
        assert!(updated.audit.updated_at >= created.audit.updated_at);
        assert!(updated.audit.updated_at >= updated.audit.created_at);
    }

    #[test]
    fn soft_delete_hides_and_restore_returns() {
        let (repo, _clock) = setup();
        let created = repo.create(memo("v1"), "alice").unwrap();

        assert!(repo.soft_delete(created.id, "bob").unwrap());
        assert!(!repo.soft_delete(created.id, "bob").unwrap());
        assert_eq!(repo.get_by_id(created.id).unwrap(), None);
        assert_eq!(repo.count().unwrap(), 0);

        let tomb = repo
            .query()
            .with_deleted()
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(tomb.audit.deleted_by.as_deref(), Some("bob"));
        assert_eq!(tomb.audit.created_by, "alice");

        assert!(repo.restore(created.id, "carol").unwrap());
        assert!(!repo.restore(created.id, "carol").unwrap());
        let back = repo.get_by_id(created.id).unwrap().unwrap();
        assert!(!back.is_deleted());
        assert_eq!(back.audit.updated_by, "carol");
    }

    #[test]
    fn absent_records_are_not_failures() {
        let (repo, _clock) = setup();
        assert!(!repo.delete(RecordId(5)).unwrap());
        assert!(!repo.soft_delete(RecordId(5), "bob").unwrap());
        assert!(!repo.restore(RecordId(5), "bob").unwrap());
        assert_eq!(repo.delete_many(|_| true).unwrap(), 0);
    }

    #[test]
    fn many_variants_batch_and_count() {
        let (repo, _clock) = setup();
        let created = repo
            .create_many(vec![memo("a"), memo("b"), memo("c")], "alice")
            .unwrap();
        assert_eq!(
            created.iter().map(|m| m.id.0).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let edited: Vec<Memo> = created
            .into_iter()
            .map(|mut m| {
                m.body.push('!');
                m
            })
            .collect();
        let updated = repo.update_many(edited, "bob").unwrap();
        assert!(updated.iter().all(|m| m.audit.updated_by == "bob"));

        assert_eq!(repo.soft_delete_many(|m| m.body != "b!", "bob").unwrap(), 2);
        assert_eq!(repo.count().unwrap(), 1);
        assert_eq!(repo.delete_many(|_| true).unwrap(), 3);
    }

    #[test]
    fn paging_and_sorting() {
        let (repo, _clock) = setup();
        let bodies = ["d", "b", "a", "c", "e"];
        repo.create_many(bodies.iter().map(|b| memo(b)).collect(), "alice")
            .unwrap();

        let page = repo
            .get_paged_sorted(|_| true, |m| m.body.clone(), true, 1, 2)
            .unwrap();
        let got: Vec<&str> = page.items.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(got, vec!["a", "b"]);
        assert_eq!(page.total_pages(), 3);

        let filtered = repo.get_paged_where(|m| m.body > "b".to_string(), 1, 10).unwrap();
        assert_eq!(filtered.total, 3);
        assert!(repo.get_paged(0, 10).is_err());
    }

    #[test]
    fn includes_load_children_in_one_pass() {
        let (repo, _clock) = setup();
        let root = repo.create(memo("root"), "alice").unwrap();
        let mut reply = memo("reply");
        reply.parent = Some(root.id);
        repo.create(reply.clone(), "alice").unwrap();
        repo.create(reply, "alice").unwrap();

        let replies = Include::<Memo>::children::<Memo>("replies", |m| m.parent);
        let loaded = repo
            .get_by_id_with_includes(root.id, std::slice::from_ref(&replies))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.related::<Memo>("replies").unwrap().len(), 2);

        let with_parent = repo
            .find_with_includes(
                |m| m.parent.is_some(),
                &[Include::<Memo>::parent::<Memo>("parent", |m| m.parent)],
            )
            .unwrap();
        assert_eq!(with_parent.len(), 2);
        let parent: Option<Memo> = with_parent[0].related_one("parent").unwrap();
        assert_eq!(parent.map(|p| p.id), Some(root.id));

        assert_eq!(repo.get_all_with_includes(&[replies]).unwrap().len(), 3);
    }
}
