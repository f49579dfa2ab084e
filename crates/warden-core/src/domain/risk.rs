//! Risks and the risk accessor.

use super::{Finding, Severity, illegal_transition};
use crate::context::DataContext;
use crate::query::{Include, Loaded};
use crate::repository::AuditableRepository;
use crate::{AuditStamp, RecordId, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Lifecycle of a risk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum RiskStatus {
    /// Recorded, not yet analysed.
    #[default]
    Identified,
    /// Analysed and rated.
    Assessed,
    /// Treatment in progress.
    Mitigating,
    /// Knowingly tolerated.
    Accepted,
    /// No longer relevant.
    Closed,
}

impl RiskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [RiskStatus; 5] = [
        Self::Identified,
        Self::Assessed,
        Self::Mitigating,
        Self::Accepted,
        Self::Closed,
    ];

    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identified => "identified",
            Self::Assessed => "assessed",
            Self::Mitigating => "mitigating",
            Self::Accepted => "accepted",
            Self::Closed => "closed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: RiskStatus) -> bool {
        use RiskStatus::{Accepted, Assessed, Closed, Identified, Mitigating};
        matches!(
            (self, next),
            (Identified, Assessed | Accepted | Closed)
                | (Assessed, Mitigating | Accepted | Closed)
                | (Mitigating, Assessed | Accepted | Closed)
                | (Accepted, Assessed | Closed)
                | (Closed, Identified)
        )
    }
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| WardenError::InvalidArgument(format!("unknown risk status '{}'", s)))
    }
}

/// A tracked risk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Risk {
    /// Store-assigned identity.
    pub id: RecordId,
    /// Short description.
    pub title: String,
    /// Optional `RiskCategory`.
    pub category_id: Option<RecordId>,
    /// Accountable principal.
    pub owner: String,
    /// Impact rating.
    pub severity: Severity,
    /// Lifecycle position.
    pub status: RiskStatus,
    /// Provenance.
    pub audit: AuditStamp,
}

crate::auditable_record!(Risk, "risks");

impl Risk {
    /// A new, unsaved risk in `Identified` status.
    #[must_use]
    pub fn new(title: impl Into<String>, owner: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            owner: owner.into(),
            severity,
            ..Self::default()
        }
    }
}

/// Filter combination for `RiskRepository::search`. Unset fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFilter {
    /// Exact status.
    pub status: Option<RiskStatus>,
    /// Minimum severity.
    pub min_severity: Option<Severity>,
    /// Exact owner.
    pub owner: Option<String>,
    /// Exact category.
    pub category_id: Option<RecordId>,
    /// Case-insensitive title substring.
    pub title_contains: Option<String>,
}

impl RiskFilter {
    /// Whether `risk` passes every set field.
    #[must_use]
    pub fn matches(&self, risk: &Risk) -> bool {
        self.status.is_none_or(|s| risk.status == s)
            && self.min_severity.is_none_or(|s| risk.severity >= s)
            && self.owner.as_deref().is_none_or(|o| risk.owner == o)
            && self.category_id.is_none_or(|c| risk.category_id == Some(c))
            && self.title_contains.as_deref().is_none_or(|needle| {
                risk.title
                    .to_lowercase()
                    .contains(&needle.to_lowercase())
            })
    }
}

/// Accessor for risks.
#[derive(Debug)]
pub struct RiskRepository {
    inner: AuditableRepository<Risk>,
}

impl Deref for RiskRepository {
    type Target = AuditableRepository<Risk>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl RiskRepository {
    pub(crate) fn new(ctx: DataContext) -> Self {
        Self {
            inner: AuditableRepository::new(ctx),
        }
    }

    /// Relation from a risk to its live findings.
    #[must_use]
    pub fn findings_include() -> Include<Risk> {
        Include::children::<Finding>("findings", |f| Some(f.risk_id))
    }

    /// Risks in `status`.
    pub fn by_status(&self, status: RiskStatus) -> Result<Vec<Risk>, WardenError> {
        self.find(|r| r.status == status)
    }

    /// Risks owned by `owner`.
    pub fn by_owner(&self, owner: &str) -> Result<Vec<Risk>, WardenError> {
        self.find(|r| r.owner == owner)
    }

    /// Risks matching `filter`, most severe first.
    pub fn search(&self, filter: &RiskFilter) -> Result<Vec<Risk>, WardenError> {
        self.query()
            .filter(|r| filter.matches(r))
            .order_by(|r| r.severity, false)
            .to_vec()
    }

    /// Live risks per status (every status present, possibly 0).
    pub fn count_by_status(&self) -> Result<BTreeMap<RiskStatus, usize>, WardenError> {
        let mut counts: BTreeMap<RiskStatus, usize> =
            RiskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for risk in self.query().as_no_tracking().to_vec()? {
            *counts.entry(risk.status).or_default() += 1;
        }
        Ok(counts)
    }

    /// Live risks per severity (every severity present, possibly 0).
    pub fn count_by_severity(&self) -> Result<BTreeMap<Severity, usize>, WardenError> {
        let mut counts: BTreeMap<Severity, usize> =
            Severity::ALL.into_iter().map(|s| (s, 0)).collect();
        for risk in self.query().as_no_tracking().to_vec()? {
            *counts.entry(risk.severity).or_default() += 1;
        }
        Ok(counts)
    }

    /// One risk with its findings loaded.
    pub fn with_findings(&self, id: RecordId) -> Result<Option<Loaded<Risk>>, WardenError> {
        self.get_by_id_with_includes(id, &[Self::findings_include()])
    }

    /// Move a risk along its lifecycle. `None` if the risk is absent.
    ///
    /// Moves the lifecycle table forbids fail with `InvalidState`.
    pub fn transition(
        &self,
        id: RecordId,
        to: RiskStatus,
        actor: &str,
    ) -> Result<Option<Risk>, WardenError> {
        let Some(mut risk) = self.get_by_id(id)? else {
            return Ok(None);
        };
        if !risk.status.can_transition_to(to) {
            return Err(illegal_transition("risk", risk.status, to));
        }
        risk.status = to;
        self.update(risk, actor).map(Some)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_table() {
        assert!(RiskStatus::Identified.can_transition_to(RiskStatus::Assessed));
        assert!(RiskStatus::Closed.can_transition_to(RiskStatus::Identified));
        assert!(!RiskStatus::Closed.can_transition_to(RiskStatus::Mitigating));
        assert!(!RiskStatus::Identified.can_transition_to(RiskStatus::Identified));
    }

    #[test]
    fn filter_combines_fields() {
        let mut risk = Risk::new("Vendor Lock-in", "alice", Severity::High);
        risk.category_id = Some(RecordId(2));

        let filter = RiskFilter {
            min_severity: Some(Severity::Medium),
            title_contains: Some("lock".into()),
            ..RiskFilter::default()
        };
        assert!(filter.matches(&risk));

        let wrong_owner = RiskFilter {
            owner: Some("bob".into()),
            ..filter.clone()
        };
        assert!(!wrong_owner.matches(&risk));

        let wrong_category = RiskFilter {
            category_id: Some(RecordId(3)),
            ..filter
        };
        assert!(!wrong_category.matches(&risk));
    }

    #[test]
    fn search_ands_fields_and_sorts_by_severity() {
        let session = crate::Session::in_memory();
        let risks = session.risks();
        for (title, owner, severity) in [
            ("Laptop theft", "alice", Severity::Medium),
            ("Cloud outage", "alice", Severity::Critical),
            ("Cloud cost spike", "bob", Severity::High),
            ("Cloud key leak", "alice", Severity::Low),
        ] {
            risks.create(Risk::new(title, owner, severity), "alice").unwrap();
        }

        let filter = RiskFilter {
            owner: Some("alice".into()),
            title_contains: Some("CLOUD".into()),
            ..RiskFilter::default()
        };
        let titles: Vec<String> = risks
            .search(&filter)
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["Cloud outage", "Cloud key leak"]);

        let severe = RiskFilter {
            min_severity: Some(Severity::High),
            ..filter
        };
        assert_eq!(risks.search(&severe).unwrap().len(), 1);

        let all = risks.search(&RiskFilter::default()).unwrap();
        assert_eq!(all.first().map(|r| r.severity), Some(Severity::Critical));
        assert_eq!(all.last().map(|r| r.severity), Some(Severity::Low));

        assert_eq!(risks.by_owner("alice").unwrap().len(), 3);
        assert!(risks.by_owner("carol").unwrap().is_empty());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in RiskStatus::ALL {
            assert_eq!(status.to_string().parse::<RiskStatus>().ok(), Some(status));
        }
    }
}
