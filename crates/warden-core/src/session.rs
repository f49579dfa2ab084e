//! # Session Module
//!
//! The unit-of-work coordinator. One `Session` per unit of work (e.g. per
//! inbound request), never shared between flows, discarded afterwards.
//!
//! A session owns:
//! - the store handle (accessors never open their own)
//! - the change tracker every accessor of the session shares
//! - one cached accessor per record type, built on first access
//!
//! ## Transaction Scope
//!
//! ```text
//! NoTransaction --begin--> Open --commit ok--> NoTransaction
//!                          Open --commit fails--> (rollback) --> NoTransaction
//!                          Open --rollback--> NoTransaction
//! ```
//!
//! `begin` while `Open`, and `commit`/`rollback` while `NoTransaction`, fail
//! with `InvalidState`. Nesting is not supported. Dropping a session with an
//! open transaction rolls it back.
//!
//! ## Conflicts
//!
//! A save rejected for stale concurrency tokens reloads every row the store
//! flagged (batch-wide, not just the first) and re-raises the conflict. The
//! rest of the rejected batch is dropped from the tracker, so no later save
//! writes it. The session never merges or retries.

use crate::cancel::CancelSignal;
use crate::clock::{Clock, SystemClock};
use crate::config::SessionOptions;
use crate::context::{DataContext, SaveReport};
use crate::domain::{AssessmentRepository, FindingRepository, RiskCategory, RiskRepository};
use crate::record::{Auditable, Identifiable, decode};
use crate::repository::{AuditableRepository, BasicRepository};
use crate::store::{MemoryStore, RecordStore, RedbStore};
use crate::tracker::{EntryKey, EntryState};
use crate::WardenError;
use std::any::{Any, TypeId};
use std::cell::{OnceCell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

/// Accessor cache for record types without a dedicated property.
type AccessorCache = RefCell<BTreeMap<TypeId, Rc<dyn Any>>>;

/// A unit of work over one record store.
pub struct Session {
    ctx: DataContext,
    risks: OnceCell<RiskRepository>,
    findings: OnceCell<FindingRepository>,
    assessments: OnceCell<AssessmentRepository>,
    categories: OnceCell<BasicRepository<RiskCategory>>,
    generic: AccessorCache,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("in_transaction", &self.in_transaction())
            .field("tracked", &self.tracked_count())
            .field("generic_accessors", &self.generic.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn from_context(ctx: DataContext) -> Self {
        Self {
            ctx,
            risks: OnceCell::new(),
            findings: OnceCell::new(),
            assessments: OnceCell::new(),
            categories: OnceCell::new(),
            generic: RefCell::new(BTreeMap::new()),
        }
    }

    /// Create a session over a fresh in-memory store with default options.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_context(DataContext::new(
            Box::new(MemoryStore::new()),
            Arc::new(SystemClock),
            SessionOptions::default(),
        ))
    }

    /// Create a session with persistent redb storage.
    ///
    /// Opens or creates a redb database at the given path.
    pub fn with_redb(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        Self::with_store(RedbStore::open(path)?)
    }

    /// Create a session over `store` with the wall clock and default options.
    pub fn with_store(store: impl RecordStore + 'static) -> Result<Self, WardenError> {
        Self::builder().store(store).build()
    }

    /// Start building a session with explicit collaborators.
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Options this session runs with.
    #[must_use]
    pub fn options(&self) -> SessionOptions {
        self.ctx.options()
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Risk accessor, built on first access.
    pub fn risks(&self) -> &RiskRepository {
        self.risks
            .get_or_init(|| RiskRepository::new(self.ctx.clone()))
    }

    /// Finding accessor, built on first access.
    pub fn findings(&self) -> &FindingRepository {
        self.findings
            .get_or_init(|| FindingRepository::new(self.ctx.clone()))
    }

    /// Compliance assessment accessor, built on first access.
    pub fn assessments(&self) -> &AssessmentRepository {
        self.assessments
            .get_or_init(|| AssessmentRepository::new(self.ctx.clone()))
    }

    /// Risk category accessor, built on first access.
    pub fn categories(&self) -> &BasicRepository<RiskCategory> {
        self.categories
            .get_or_init(|| BasicRepository::new(self.ctx.clone()))
    }

    /// Cached accessor of type `A`, built by `make` on first request.
    fn cached<A: 'static>(&self, make: impl Fn() -> A) -> Rc<A> {
        let mut cache = self.generic.borrow_mut();
        let slot = cache
            .entry(TypeId::of::<A>())
            .or_insert_with(|| Rc::new(make()) as Rc<dyn Any>);
        match Rc::clone(slot).downcast::<A>() {
            Ok(accessor) => accessor,
            Err(_) => {
                // Keys are the accessor's own TypeId; rebuild rather than trust a bad slot.
                let accessor = Rc::new(make());
                *slot = Rc::clone(&accessor) as Rc<dyn Any>;
                accessor
            }
        }
    }

    /// Auditable accessor for any record type, cached for this session.
    pub fn repository<T: Auditable>(&self) -> Rc<AuditableRepository<T>> {
        self.cached(|| AuditableRepository::<T>::new(self.ctx.clone()))
    }

    /// Basic accessor for any record type, cached for this session.
    pub fn basic_repository<T: Identifiable>(&self) -> Rc<BasicRepository<T>> {
        self.cached(|| BasicRepository::<T>::new(self.ctx.clone()))
    }

    // =========================================================================
    // SAVE
    // =========================================================================

    /// Flush every pending change in one batch.
    ///
    /// If the store rejects the batch none of it stays pending. On
    /// `Conflict` the flagged rows have been reloaded when this returns.
    pub fn save_changes(&self) -> Result<SaveReport, WardenError> {
        self.ctx.save(None)
    }

    /// `save_changes`, abandoned before the store round-trip if `cancel` fired.
    pub fn save_changes_with(&self, cancel: &CancelSignal) -> Result<SaveReport, WardenError> {
        self.ctx.save(Some(cancel))
    }

    /// Save without change detection or post-save tracking.
    ///
    /// Saved entries are detached instead of re-snapshotted. The previous
    /// setting is restored afterwards, also on failure.
    pub fn bulk_save_changes(&self, cancel: &CancelSignal) -> Result<SaveReport, WardenError> {
        let previous = self.ctx.set_auto_detect(false);
        let result = self.ctx.save(Some(cancel));
        self.ctx.set_auto_detect(previous);
        result
    }

    /// Whether any tracked record has unsaved changes.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.ctx.has_changes()
    }

    /// Forget every tracked record without touching the store.
    pub fn detach_all(&self) {
        self.ctx.detach_all();
    }

    /// Number of tracked records.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.ctx.tracked_count()
    }

    /// Pending state of a staged or tracked entry.
    #[must_use]
    pub fn entry_state(&self, key: EntryKey) -> Option<EntryState> {
        self.ctx.entry_state(key)
    }

    /// Discard `entity`'s tracked state and re-read it from the store.
    ///
    /// Returns `false` (entity untouched) if the record no longer exists.
    pub fn reload<T: Identifiable>(&self, entity: &mut T) -> Result<bool, WardenError> {
        match self.ctx.reload(T::RECORD_TYPE, entity.id())? {
            Some(row) => {
                *entity = decode(&row)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stored rows of a record type, tombstoned ones included.
    pub fn row_count<T: Identifiable>(&self) -> Result<usize, WardenError> {
        self.ctx.count(T::RECORD_TYPE)
    }

    // =========================================================================
    // TRANSACTIONS
    // =========================================================================

    /// Whether an explicit transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.ctx.in_transaction()
    }

    /// Open an explicit transaction. Fails if one is already open.
    pub fn begin_transaction(&self) -> Result<(), WardenError> {
        if self.in_transaction() {
            return Err(WardenError::InvalidState(
                "a transaction is already open; nesting is not supported".to_string(),
            ));
        }
        self.ctx.begin_transaction()?;
        tracing::debug!(target: "warden::session", "transaction opened");
        Ok(())
    }

    /// Save pending changes, then commit.
    ///
    /// Any failure in either step rolls the transaction back before the
    /// error is returned.
    pub fn commit_transaction(&self) -> Result<SaveReport, WardenError> {
        if !self.in_transaction() {
            return Err(WardenError::InvalidState(
                "no transaction is open".to_string(),
            ));
        }
        let result = self
            .ctx
            .save(None)
            .and_then(|report| self.ctx.commit_transaction().map(|()| report));
        match result {
            Ok(report) => {
                tracing::debug!(target: "warden::session", writes = report.len(), "transaction committed");
                Ok(report)
            }
            Err(e) => {
                tracing::debug!(target: "warden::session", error = %e, "commit failed; rolling back");
                if self.in_transaction() {
                    if let Err(rollback) = self.ctx.rollback_transaction() {
                        tracing::warn!(target: "warden::session", error = %rollback, "rollback after failed commit failed");
                    }
                }
                self.ctx.detach_all();
                Err(e)
            }
        }
    }

    /// Discard every write made since `begin_transaction`.
    ///
    /// Tracked state is detached: snapshots may describe rolled-back writes.
    pub fn rollback_transaction(&self) -> Result<(), WardenError> {
        if !self.in_transaction() {
            return Err(WardenError::InvalidState(
                "no transaction is open".to_string(),
            ));
        }
        self.ctx.rollback_transaction()?;
        tracing::debug!(target: "warden::session", "transaction rolled back");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.in_transaction() {
            if let Err(e) = self.ctx.rollback_transaction() {
                tracing::warn!(target: "warden::session", error = %e, "rollback on drop failed");
            }
        }
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for sessions with explicit collaborators.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    store: Option<Box<dyn RecordStore>>,
    clock: Option<Arc<dyn Clock>>,
    options: SessionOptions,
}

impl SessionBuilder {
    /// Store the session will own. Required.
    #[must_use]
    pub fn store(mut self, store: impl RecordStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Already-boxed store the session will own.
    #[must_use]
    pub fn boxed_store(mut self, store: Box<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source for provenance stamps. Defaults to the wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Session options. Defaults to `SessionOptions::default()`.
    #[must_use]
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the session.
    ///
    /// Fails with `MissingCollaborator("store")` if no store was supplied.
    pub fn build(self) -> Result<Session, WardenError> {
        let store = self
            .store
            .ok_or(WardenError::MissingCollaborator("store"))?;
        self.options.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Ok(Session::from_context(DataContext::new(
            store,
            clock,
            self.options,
        )))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{Finding, Risk, RiskStatus, Severity};
    use crate::{AuditStamp, RecordId};
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Vendor {
        id: RecordId,
        name: String,
        audit: AuditStamp,
    }
    crate::auditable_record!(Vendor, "vendors");

    #[test]
    fn builder_requires_a_store() {
        let err = Session::builder().build().unwrap_err();
        assert!(matches!(err, WardenError::MissingCollaborator("store")));
    }

    #[test]
    fn every_constructor_runs_with_valid_defaults() {
        assert!(SessionOptions::default().validate().is_ok());
        let built = Session::with_store(MemoryStore::new()).unwrap();
        assert_eq!(built.options(), Session::in_memory().options());
    }

    #[test]
    fn builder_rejects_invalid_options() {
        let result = Session::builder()
            .store(MemoryStore::new())
            .options(SessionOptions {
                max_page_size: 0,
                ..SessionOptions::default()
            })
            .build();
        assert!(matches!(result, Err(WardenError::InvalidArgument(_))));
    }

    #[test]
    fn accessors_are_cached_per_session() {
        let session = Session::in_memory();
        assert!(std::ptr::eq(session.risks(), session.risks()));

        let a = session.repository::<Vendor>();
        let b = session.repository::<Vendor>();
        assert!(Rc::ptr_eq(&a, &b));

        // A second session has its own cache.
        let other = Session::in_memory();
        assert!(!Rc::ptr_eq(&a, &other.repository::<Vendor>()));

        let vendor = Vendor {
            id: RecordId::UNASSIGNED,
            name: "Acme".to_string(),
            audit: AuditStamp::default(),
        };
        let saved = b.create(vendor, "alice").unwrap();
        assert_eq!(a.get_by_id(saved.id).unwrap().unwrap().name, "Acme");
        assert!(other.repository::<Vendor>().get_all().unwrap().is_empty());
    }

    #[test]
    fn accessors_share_one_tracker() {
        let session = Session::in_memory();
        let risk = session
            .risks()
            .create(Risk::new("Outage", "alice", Severity::High), "alice")
            .unwrap();
        session
            .findings()
            .create(Finding::new(risk.id, "No failover", Severity::High), "alice")
            .unwrap();
        assert_eq!(session.tracked_count(), 2);

        let generic = session.repository::<Risk>();
        assert_eq!(generic.count().unwrap(), 1);
    }

    #[test]
    fn transaction_misuse_is_invalid_state() {
        let session = Session::in_memory();
        assert!(matches!(
            session.commit_transaction(),
            Err(WardenError::InvalidState(_))
        ));
        assert!(matches!(
            session.rollback_transaction(),
            Err(WardenError::InvalidState(_))
        ));
        session.begin_transaction().unwrap();
        assert!(matches!(
            session.begin_transaction(),
            Err(WardenError::InvalidState(_))
        ));
        session.rollback_transaction().unwrap();
        assert!(!session.in_transaction());
    }

    #[test]
    fn rollback_discards_writes_and_tracking() {
        let session = Session::in_memory();
        session.begin_transaction().unwrap();
        session
            .risks()
            .create(Risk::new("Temp", "alice", Severity::Low), "alice")
            .unwrap();
        assert_eq!(session.risks().count().unwrap(), 1);

        session.rollback_transaction().unwrap();
        assert_eq!(session.risks().count().unwrap(), 0);
        assert_eq!(session.tracked_count(), 0);
    }

    #[test]
    fn rolled_back_ids_are_not_handed_out_again() {
        let session = Session::in_memory();
        let first = session
            .risks()
            .create(Risk::new("Kept", "alice", Severity::Low), "alice")
            .unwrap();

        session.begin_transaction().unwrap();
        let discarded = session
            .risks()
            .create(Risk::new("Temp", "alice", Severity::Low), "alice")
            .unwrap();
        session.rollback_transaction().unwrap();

        let next = session
            .risks()
            .create(Risk::new("Next", "alice", Severity::Low), "alice")
            .unwrap();
        assert_ne!(next.id, discarded.id);
        assert!(next.id > discarded.id && discarded.id > first.id);
        assert!(next.audit.concurrency_token > discarded.audit.concurrency_token);
    }

    #[test]
    fn staged_changes_flush_on_commit() {
        let session = Session::in_memory();
        session.begin_transaction().unwrap();
        let mut risk = Risk::new("Staged", "alice", Severity::Medium);
        let key = session.risks().stage_create(&mut risk, "alice").unwrap();
        assert!(session.has_pending_changes());
        assert_eq!(session.entry_state(key), Some(EntryState::Added));

        let report = session.commit_transaction().unwrap();
        assert_eq!(report.assigned_id(key), Some(RecordId(1)));
        assert!(!session.has_pending_changes());
        assert_eq!(session.risks().count().unwrap(), 1);
    }

    #[test]
    fn cancelled_save_keeps_changes_pending() {
        let session = Session::in_memory();
        let mut risk = Risk::new("Later", "alice", Severity::Low);
        session.risks().stage_create(&mut risk, "alice").unwrap();

        let cancel = CancelSignal::new();
        cancel.cancel();
        assert!(matches!(
            session.save_changes_with(&cancel),
            Err(WardenError::Cancelled)
        ));
        assert!(session.has_pending_changes());

        session.save_changes().unwrap();
        assert_eq!(session.risks().count().unwrap(), 1);
    }

    #[test]
    fn bulk_save_detaches_and_restores_detection() {
        let session = Session::in_memory();
        for i in 0..3 {
            let mut risk = Risk::new(format!("Bulk {}", i), "ops", Severity::Low);
            session.risks().stage_create(&mut risk, "ops").unwrap();
        }

        let report = session.bulk_save_changes(&CancelSignal::new()).unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(session.tracked_count(), 0);

        // Normal saves track again.
        session
            .risks()
            .create(Risk::new("Tracked", "ops", Severity::Low), "ops")
            .unwrap();
        assert_eq!(session.tracked_count(), 1);
    }

    #[test]
    fn bulk_save_restores_detection_after_cancel() {
        let session = Session::in_memory();
        let mut risk = Risk::new("Bulk", "ops", Severity::Low);
        session.risks().stage_create(&mut risk, "ops").unwrap();
        let cancel = CancelSignal::new();
        cancel.cancel();

        assert!(session.bulk_save_changes(&cancel).is_err());
        session.save_changes().unwrap();
        assert_eq!(session.tracked_count(), 1);
    }

    #[test]
    fn reload_refreshes_a_stale_copy() {
        let session = Session::in_memory();
        let risk = session
            .risks()
            .create(Risk::new("Drift", "alice", Severity::Low), "alice")
            .unwrap();
        let mut stale = risk.clone();

        let mut newer = risk;
        newer.status = RiskStatus::Assessed;
        session.risks().update(newer, "bob").unwrap();

        assert!(session.reload(&mut stale).unwrap());
        assert_eq!(stale.status, RiskStatus::Assessed);
        assert_eq!(stale.audit.updated_by, "bob");

        let mut ghost = Risk::new("Ghost", "alice", Severity::Low);
        ghost.id = RecordId(99);
        assert!(!session.reload(&mut ghost).unwrap());
    }

    #[test]
    fn drop_rolls_back_open_transaction() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("warden.redb");
        {
            let session = Session::with_redb(&path).expect("open");
            session.begin_transaction().unwrap();
            session
                .risks()
                .create(Risk::new("Abandoned", "alice", Severity::Low), "alice")
                .unwrap();
        }
        let session = Session::with_redb(&path).expect("reopen");
        assert_eq!(session.risks().count().unwrap(), 0);
    }

    #[test]
    fn redb_session_persists_across_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("warden.redb");
        let id = {
            let session = Session::with_redb(&path).expect("open");
            session
                .risks()
                .create(Risk::new("Durable", "alice", Severity::High), "alice")
                .unwrap()
                .id
        };
        let session = Session::with_redb(&path).expect("reopen");
        let risk = session.risks().get_by_id(id).unwrap().unwrap();
        assert_eq!(risk.title, "Durable");
        assert_eq!(risk.audit.created_by, "alice");
    }
}
