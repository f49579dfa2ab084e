//! # CLI Command Implementations
//!
//! Each command works against one session and returns a JSON report.
//! Mutating commands run inside an explicit transaction, so a failure
//! anywhere leaves the register untouched.

use crate::config::WardenConfig;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt::Display;
use warden_core::{
    Finding, RecordId, RedbStore, Risk, RiskCategory, RiskFilter, RiskRepository, RiskStatus,
    Session, Severity, WardenError,
};

// =============================================================================
// SESSION HELPERS
// =============================================================================

/// Open a redb-backed session with the configured options.
pub fn open_session(config: &WardenConfig) -> Result<Session, WardenError> {
    let store = RedbStore::open(&config.database)?;
    tracing::debug!(database = %config.database.display(), "register opened");
    Session::builder()
        .store(store)
        .options(config.session)
        .build()
}

/// Run `work` inside an explicit transaction, committing on success.
fn transactional<T>(
    session: &Session,
    work: impl FnOnce(&Session) -> Result<T, WardenError>,
) -> Result<T, WardenError> {
    session.begin_transaction()?;
    match work(session) {
        Ok(value) => {
            session.commit_transaction()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = session.rollback_transaction() {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

fn to_json(value: &impl serde::Serialize) -> Result<Value, WardenError> {
    serde_json::to_value(value).map_err(|e| WardenError::SerializationError(e.to_string()))
}

fn not_found(kind: &str, id: u64) -> WardenError {
    WardenError::InvalidArgument(format!("no {} with id {}", kind, id))
}

fn counts<K: Display>(map: BTreeMap<K, usize>) -> Value {
    Value::Object(
        map.into_iter()
            .map(|(k, v)| (k.to_string(), Value::from(v)))
            .collect(),
    )
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Initialize a new register database.
pub fn cmd_init(config: &WardenConfig, force: bool) -> Result<Value, WardenError> {
    let path = &config.database;
    if path.exists() {
        if !force {
            return Err(WardenError::InvalidState(format!(
                "database '{}' already exists; use --force to replace it",
                path.display()
            )));
        }
        std::fs::remove_file(path).map_err(|e| {
            WardenError::IoError(format!("Cannot remove '{}': {}", path.display(), e))
        })?;
    }
    RedbStore::open(path)?;
    tracing::info!(database = %path.display(), "register initialized");
    Ok(json!({
        "database": path.to_string_lossy(),
        "initialized": true,
    }))
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show register counts.
pub fn cmd_status(session: &Session, config: &WardenConfig) -> Result<Value, WardenError> {
    let risks = session.risks();
    Ok(json!({
        "database": config.database.to_string_lossy(),
        "actor": config.actor,
        "risks": risks.count()?,
        "risks_by_status": counts(risks.count_by_status()?),
        "risks_by_severity": counts(risks.count_by_severity()?),
        "open_findings": session.findings().open_findings()?.len(),
        "categories": session.categories().count()?,
        "tombstoned_risks": session.row_count::<Risk>()?.saturating_sub(risks.count()?),
    }))
}

// =============================================================================
// RISK COMMANDS
// =============================================================================

/// Record a new risk.
pub fn cmd_risk_add(
    session: &Session,
    actor: &str,
    title: &str,
    severity: &str,
    owner: Option<String>,
    category: Option<u64>,
) -> Result<Value, WardenError> {
    let severity: Severity = severity.parse()?;
    let risk = transactional(session, |s| {
        if let Some(category) = category {
            if s.categories().get_by_id(RecordId(category))?.is_none() {
                return Err(not_found("category", category));
            }
        }
        let mut risk = Risk::new(title, owner.as_deref().unwrap_or(actor), severity);
        risk.category_id = category.map(RecordId);
        s.risks().create(risk, actor)
    })?;
    tracing::info!(id = %risk.id, actor, "risk recorded");
    to_json(&risk)
}

/// List live risks matching the given filters, most severe first.
pub fn cmd_risk_list(
    session: &Session,
    status: Option<String>,
    min_severity: Option<String>,
    owner: Option<String>,
    page: usize,
    page_size: usize,
) -> Result<Value, WardenError> {
    let filter = RiskFilter {
        status: status.as_deref().map(str::parse::<RiskStatus>).transpose()?,
        min_severity: min_severity
            .as_deref()
            .map(str::parse::<Severity>)
            .transpose()?,
        owner,
        ..RiskFilter::default()
    };
    let page = session
        .risks()
        .query()
        .as_no_tracking()
        .filter(move |r| filter.matches(r))
        .order_by(|r| r.severity, false)
        .page(page, page_size)?;
    let mut report = to_json(&page)?;
    if let Value::Object(map) = &mut report {
        map.insert("total_pages".to_string(), Value::from(page.total_pages()));
        map.insert("has_next".to_string(), Value::from(page.has_next()));
    }
    Ok(report)
}

/// Show one risk with its findings.
pub fn cmd_risk_show(session: &Session, id: u64) -> Result<Value, WardenError> {
    let loaded = session
        .risks()
        .with_findings(RecordId(id))?
        .ok_or_else(|| not_found("risk", id))?;
    let findings: Vec<Finding> = loaded.related(RiskRepository::findings_include().name())?;
    Ok(json!({
        "risk": to_json(&loaded.record)?,
        "findings": to_json(&findings)?,
    }))
}

/// Move a risk along its lifecycle.
pub fn cmd_risk_transition(
    session: &Session,
    actor: &str,
    id: u64,
    status: &str,
) -> Result<Value, WardenError> {
    let to: RiskStatus = status.parse()?;
    let risk = transactional(session, |s| s.risks().transition(RecordId(id), to, actor))?
        .ok_or_else(|| not_found("risk", id))?;
    tracing::info!(id = %risk.id, status = %to, actor, "risk transitioned");
    to_json(&risk)
}

/// Tombstone (or with `hard`, remove) a risk.
pub fn cmd_risk_delete(
    session: &Session,
    actor: &str,
    id: u64,
    hard: bool,
) -> Result<Value, WardenError> {
    let deleted = transactional(session, |s| {
        if hard {
            s.risks().delete(RecordId(id))
        } else {
            s.risks().soft_delete(RecordId(id), actor)
        }
    })?;
    Ok(json!({
        "id": id,
        "deleted": deleted,
        "mode": if hard { "hard" } else { "soft" },
    }))
}

// =============================================================================
// FINDING COMMANDS
// =============================================================================

/// Raise a finding against a live risk.
pub fn cmd_finding_add(
    session: &Session,
    actor: &str,
    risk_id: u64,
    title: &str,
    severity: &str,
) -> Result<Value, WardenError> {
    let severity: Severity = severity.parse()?;
    let finding = transactional(session, |s| {
        if s.risks().get_by_id(RecordId(risk_id))?.is_none() {
            return Err(not_found("risk", risk_id));
        }
        s.findings()
            .create(Finding::new(RecordId(risk_id), title, severity), actor)
    })?;
    to_json(&finding)
}

/// Mark a finding resolved.
pub fn cmd_finding_resolve(session: &Session, actor: &str, id: u64) -> Result<Value, WardenError> {
    let finding = transactional(session, |s| s.findings().resolve(RecordId(id), actor))?
        .ok_or_else(|| not_found("finding", id))?;
    to_json(&finding)
}

// =============================================================================
// CATEGORY COMMANDS
// =============================================================================

/// Create a category with a unique code.
pub fn cmd_category_add(session: &Session, code: &str, label: &str) -> Result<Value, WardenError> {
    let code = code.trim().to_ascii_uppercase();
    let category = transactional(session, |s| {
        if s.categories().exists(|c| c.code == code)? {
            return Err(WardenError::InvalidArgument(format!(
                "category '{}' already exists",
                code
            )));
        }
        s.categories().create(RiskCategory::new(code.clone(), label))
    })?;
    to_json(&category)
}

/// List categories by code.
pub fn cmd_category_list(session: &Session) -> Result<Value, WardenError> {
    let categories = session
        .categories()
        .query()
        .as_no_tracking()
        .order_by(|c| c.code.clone(), true)
        .to_vec()?;
    to_json(&categories)
}
