//! Findings raised against risks.

use super::{Severity, illegal_transition};
use crate::context::DataContext;
use crate::repository::AuditableRepository;
use crate::{AuditStamp, RecordId, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Lifecycle of a finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum FindingStatus {
    /// Raised, nobody working on it.
    #[default]
    Open,
    /// Being fixed.
    Remediating,
    /// Fixed.
    Resolved,
    /// Not a real issue.
    Dismissed,
}

impl FindingStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [FindingStatus; 4] = [
        Self::Open,
        Self::Remediating,
        Self::Resolved,
        Self::Dismissed,
    ];

    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Remediating => "remediating",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    /// Whether work on the finding is still outstanding.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::Remediating)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: FindingStatus) -> bool {
        use FindingStatus::{Dismissed, Open, Remediating, Resolved};
        matches!(
            (self, next),
            (Open, Remediating | Resolved | Dismissed)
                | (Remediating, Open | Resolved)
                | (Resolved | Dismissed, Open)
        )
    }
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| WardenError::InvalidArgument(format!("unknown finding status '{}'", s)))
    }
}

/// An issue observed against a risk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Finding {
    /// Store-assigned identity.
    pub id: RecordId,
    /// Owning risk.
    pub risk_id: RecordId,
    /// Short description.
    pub title: String,
    /// Impact rating.
    pub severity: Severity,
    /// Lifecycle position.
    pub status: FindingStatus,
    /// Principal working on it, if any.
    pub assignee: Option<String>,
    /// Provenance.
    pub audit: AuditStamp,
}

crate::auditable_record!(Finding, "findings");

impl Finding {
    /// A new, unsaved open finding.
    #[must_use]
    pub fn new(risk_id: RecordId, title: impl Into<String>, severity: Severity) -> Self {
        Self {
            risk_id,
            title: title.into(),
            severity,
            ..Self::default()
        }
    }
}

/// Accessor for findings.
#[derive(Debug)]
pub struct FindingRepository {
    inner: AuditableRepository<Finding>,
}

impl Deref for FindingRepository {
    type Target = AuditableRepository<Finding>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FindingRepository {
    pub(crate) fn new(ctx: DataContext) -> Self {
        Self {
            inner: AuditableRepository::new(ctx),
        }
    }

    /// Findings of one risk.
    pub fn for_risk(&self, risk_id: RecordId) -> Result<Vec<Finding>, WardenError> {
        self.find(|f| f.risk_id == risk_id)
    }

    /// Findings still open or in remediation, most severe first.
    pub fn open_findings(&self) -> Result<Vec<Finding>, WardenError> {
        self.query()
            .filter(|f| f.status.is_open())
            .order_by(|f| f.severity, false)
            .to_vec()
    }

    /// Findings assigned to `assignee`.
    pub fn by_assignee(&self, assignee: &str) -> Result<Vec<Finding>, WardenError> {
        self.find(|f| f.assignee.as_deref() == Some(assignee))
    }

    /// Live findings per severity (every severity present, possibly 0).
    pub fn count_by_severity(&self) -> Result<BTreeMap<Severity, usize>, WardenError> {
        let mut counts: BTreeMap<Severity, usize> =
            Severity::ALL.into_iter().map(|s| (s, 0)).collect();
        for finding in self.query().as_no_tracking().to_vec()? {
            *counts.entry(finding.severity).or_default() += 1;
        }
        Ok(counts)
    }

    /// Hand a finding to `assignee`; an open finding moves to remediation.
    pub fn assign(
        &self,
        id: RecordId,
        assignee: &str,
        actor: &str,
    ) -> Result<Option<Finding>, WardenError> {
        let Some(mut finding) = self.get_by_id(id)? else {
            return Ok(None);
        };
        finding.assignee = Some(assignee.to_string());
        if finding.status == FindingStatus::Open {
            finding.status = FindingStatus::Remediating;
        }
        self.update(finding, actor).map(Some)
    }

    /// Mark a finding resolved. Closed findings fail with `InvalidState`.
    pub fn resolve(&self, id: RecordId, actor: &str) -> Result<Option<Finding>, WardenError> {
        let Some(mut finding) = self.get_by_id(id)? else {
            return Ok(None);
        };
        if !finding.status.can_transition_to(FindingStatus::Resolved) {
            return Err(illegal_transition(
                "finding",
                finding.status,
                FindingStatus::Resolved,
            ));
        }
        finding.status = FindingStatus::Resolved;
        self.update(finding, actor).map(Some)
    }
}
