//! Basic Accessor: CRUD for records that only satisfy `Identifiable`.
//!
//! No provenance and no concurrency check. Two writers updating the same
//! record race at the store and the last write wins.

use super::{apply_saved, count_existed, fetch};
use crate::context::DataContext;
use crate::query::Query;
use crate::record::{Identifiable, encode};
use crate::tracker::EntryKey;
use crate::{RecordId, WardenError};
use std::fmt;
use std::marker::PhantomData;

/// Generic accessor for one plain record type.
pub struct BasicRepository<T: Identifiable> {
    ctx: DataContext,
    _record: PhantomData<fn() -> T>,
}

impl<T: Identifiable> fmt::Debug for BasicRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicRepository")
            .field("record_type", &T::RECORD_TYPE)
            .finish()
    }
}

impl<T: Identifiable> BasicRepository<T> {
    pub(crate) fn new(ctx: DataContext) -> Self {
        Self {
            ctx,
            _record: PhantomData,
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Every record, in id order.
    pub fn get_all(&self) -> Result<Vec<T>, WardenError> {
        self.query().to_vec()
    }

    /// One record, or `None` if absent.
    pub fn get_by_id(&self, id: RecordId) -> Result<Option<T>, WardenError> {
        fetch(&self.ctx, id, false)
    }

    /// Records matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Result<Vec<T>, WardenError> {
        self.query().filter(predicate).to_vec()
    }

    /// First record (by id) matching `predicate`.
    pub fn first_or_default(
        &self,
        predicate: impl Fn(&T) -> bool,
    ) -> Result<Option<T>, WardenError> {
        self.query().filter(predicate).first()
    }

    /// Whether any record matches `predicate`.
    pub fn exists(&self, predicate: impl Fn(&T) -> bool) -> Result<bool, WardenError> {
        self.query().filter(predicate).as_no_tracking().any()
    }

    /// Number of records.
    pub fn count(&self) -> Result<usize, WardenError> {
        self.query().as_no_tracking().count()
    }

    /// Number of records matching `predicate`.
    pub fn count_where(&self, predicate: impl Fn(&T) -> bool) -> Result<usize, WardenError> {
        self.query().filter(predicate).as_no_tracking().count()
    }

    /// Composable query over this record type.
    pub fn query<'q>(&self) -> Query<'q, T> {
        Query::new(self.ctx.clone())
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Persist a new record. Any caller-supplied id is ignored.
    pub fn create(&self, mut entity: T) -> Result<T, WardenError> {
        let key = self.stage_create(&entity)?;
        let report = self.ctx.save(None)?;
        apply_saved(&self.ctx, &report, key, &mut entity)?;
        Ok(entity)
    }

    /// Overwrite a record. A record that no longer exists is a conflict.
    pub fn update(&self, mut entity: T) -> Result<T, WardenError> {
        let key = self.stage_update(&entity)?;
        let report = self.ctx.save(None)?;
        apply_saved(&self.ctx, &report, key, &mut entity)?;
        Ok(entity)
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub fn delete(&self, id: RecordId) -> Result<bool, WardenError> {
        let key = self.stage_delete(id);
        let report = self.ctx.save(None)?;
        Ok(report.existed(key) == Some(true))
    }

    /// Persist many new records in one store write. Returns how many.
    pub fn bulk_create(&self, entities: &[T]) -> Result<usize, WardenError> {
        let keys = entities
            .iter()
            .map(|e| self.stage_create(e))
            .collect::<Result<Vec<_>, _>>()?;
        let report = self.ctx.save(None)?;
        Ok(keys
            .iter()
            .filter(|key| report.assigned_id(**key).is_some())
            .count())
    }

    /// Overwrite many records in one store write. Returns how many.
    pub fn bulk_update(&self, entities: &[T]) -> Result<usize, WardenError> {
        let keys = entities
            .iter()
            .map(|e| self.stage_update(e))
            .collect::<Result<Vec<_>, _>>()?;
        let report = self.ctx.save(None)?;
        Ok(keys
            .iter()
            .filter(|key| report.token(**key).is_some())
            .count())
    }

    /// Remove many records in one store write. Returns how many existed.
    pub fn bulk_delete(&self, ids: &[RecordId]) -> Result<usize, WardenError> {
        let keys: Vec<EntryKey> = ids.iter().map(|id| self.stage_delete(*id)).collect();
        let report = self.ctx.save(None)?;
        Ok(count_existed(&report, &keys))
    }

    // =========================================================================
    // STAGING (flushed by the session)
    // =========================================================================

    /// Stage an insert without saving.
    pub fn stage_create(&self, entity: &T) -> Result<EntryKey, WardenError> {
        let mut fresh = entity.clone();
        fresh.set_id(RecordId::UNASSIGNED);
        Ok(self.ctx.stage_insert(T::RECORD_TYPE, encode(&fresh)?))
    }

    /// Stage an unguarded overwrite without saving.
    pub fn stage_update(&self, entity: &T) -> Result<EntryKey, WardenError> {
        Ok(self
            .ctx
            .stage_update(T::RECORD_TYPE, entity.id(), encode(entity)?, None))
    }

    /// Stage a delete without saving.
    pub fn stage_delete(&self, id: RecordId) -> EntryKey {
        self.ctx.stage_delete(T::RECORD_TYPE, id)
    }
}
