//! # warden-core
//!
//! The audited data-access layer for Warden - THE LOGIC.
//!
//! This crate implements a uniform repository and unit-of-work layer over
//! pluggable record stores: one generic accessor per record contract, one
//! change tracker per session, optimistic concurrency on every guarded write.
//!
//! ## Layers
//!
//! - `record` → the `Identifiable` / `Auditable` contracts and row codec
//! - `store` → the `RecordStore` contract (in-memory and redb backends)
//! - `tracker` + `context` → pending changes, batch save, conflict reload
//! - `query` → lazy filtered/ordered/paged reads with eager includes
//! - `repository` → `BasicRepository` and `AuditableRepository`
//! - `domain` → representative specialized accessors
//! - `session` → the unit-of-work coordinator
//!
//! ## Architectural Constraints
//!
//! - Single-flow: a `Session` is owned by exactly one unit of work
//! - Deterministic: BTreeMap only, rows iterate in id order
//! - No async, no network dependencies (pure Rust)
//! - Provenance (`created_*`) is written once, on insert

// =============================================================================
// MODULES
// =============================================================================

pub mod cancel;
pub mod clock;
pub mod config;
mod context;
pub mod domain;
pub mod primitives;
pub mod query;
pub mod record;
pub mod repository;
pub mod session;
pub mod store;
pub mod tracker;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{AuditStamp, ConcurrencyToken, ConflictSet, ConflictedRow, RecordId, WardenError};

// =============================================================================
// RE-EXPORTS: Records & Stores
// =============================================================================

pub use record::{Auditable, Identifiable, decode, encode};
pub use store::{MemoryStore, RecordStore, RedbStore, StoredRow, WriteOp, WriteOutcome};

// =============================================================================
// RE-EXPORTS: Unit of Work
// =============================================================================

pub use cancel::CancelSignal;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionOptions;
pub use context::SaveReport;
pub use query::{Include, Loaded, Page, Query};
pub use repository::{AuditableRepository, BasicRepository};
pub use session::{Session, SessionBuilder};
pub use tracker::{EntryKey, EntryState};

// =============================================================================
// RE-EXPORTS: Domain
// =============================================================================

pub use domain::{
    AssessmentRepository, AssessmentStatus, ComplianceAssessment, Finding, FindingRepository,
    FindingStatus, Risk, RiskCategory, RiskFilter, RiskRepository, RiskStatus, Severity,
};
