//! Compliance assessments of framework controls.

use super::illegal_transition;
use crate::context::DataContext;
use crate::repository::AuditableRepository;
use crate::{AuditStamp, RecordId, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

/// Highest accepted assessment score.
pub const MAX_SCORE: u8 = 100;

/// Outcome of assessing one control.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum AssessmentStatus {
    /// Scheduled.
    #[default]
    NotStarted,
    /// Evidence being gathered.
    InProgress,
    /// Control satisfied.
    Compliant,
    /// Control not satisfied.
    NonCompliant,
    /// Control does not apply.
    NotApplicable,
}

impl AssessmentStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [AssessmentStatus; 5] = [
        Self::NotStarted,
        Self::InProgress,
        Self::Compliant,
        Self::NonCompliant,
        Self::NotApplicable,
    ];

    /// Whether the assessment has concluded.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Compliant | Self::NonCompliant | Self::NotApplicable
        )
    }

    /// Snake-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Compliant => "compliant",
            Self::NonCompliant => "non_compliant",
            Self::NotApplicable => "not_applicable",
        }
    }
}

impl fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assessment of one control of one framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ComplianceAssessment {
    /// Store-assigned identity.
    pub id: RecordId,
    /// Framework name, e.g. `ISO27001`.
    pub framework: String,
    /// Control reference within the framework, e.g. `A.5.1`.
    pub control_ref: String,
    /// Outcome so far.
    pub status: AssessmentStatus,
    /// Score in `0..=100`, once concluded.
    pub score: Option<u8>,
    /// Principal performing the assessment.
    pub assessor: String,
    /// Risk this assessment informs, if any.
    pub risk_id: Option<RecordId>,
    /// Provenance.
    pub audit: AuditStamp,
}

crate::auditable_record!(ComplianceAssessment, "compliance_assessments");

impl ComplianceAssessment {
    /// A new, unsaved assessment in `NotStarted` status.
    #[must_use]
    pub fn new(
        framework: impl Into<String>,
        control_ref: impl Into<String>,
        assessor: impl Into<String>,
    ) -> Self {
        Self {
            framework: framework.into(),
            control_ref: control_ref.into(),
            assessor: assessor.into(),
            ..Self::default()
        }
    }
}

/// Accessor for compliance assessments.
#[derive(Debug)]
pub struct AssessmentRepository {
    inner: AuditableRepository<ComplianceAssessment>,
}

impl Deref for AssessmentRepository {
    type Target = AuditableRepository<ComplianceAssessment>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AssessmentRepository {
    pub(crate) fn new(ctx: DataContext) -> Self {
        Self {
            inner: AuditableRepository::new(ctx),
        }
    }

    /// Assessments of one framework, by control reference.
    pub fn by_framework(&self, framework: &str) -> Result<Vec<ComplianceAssessment>, WardenError> {
        self.query()
            .filter(|a| a.framework == framework)
            .order_by(|a| a.control_ref.clone(), true)
            .to_vec()
    }

    /// Most recently updated assessment of a control.
    pub fn latest_for_control(
        &self,
        framework: &str,
        control_ref: &str,
    ) -> Result<Option<ComplianceAssessment>, WardenError> {
        self.query()
            .filter(|a| a.framework == framework && a.control_ref == control_ref)
            .order_by(|a| (a.audit.updated_at, a.id), false)
            .first()
    }

    /// Assessments of one framework per status (every status present).
    pub fn count_by_status(
        &self,
        framework: &str,
    ) -> Result<BTreeMap<AssessmentStatus, usize>, WardenError> {
        let mut counts: BTreeMap<AssessmentStatus, usize> =
            AssessmentStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        let assessed = self
            .query()
            .filter(|a| a.framework == framework)
            .as_no_tracking()
            .to_vec()?;
        for assessment in assessed {
            *counts.entry(assessment.status).or_default() += 1;
        }
        Ok(counts)
    }

    /// Conclude an assessment. `None` if absent.
    ///
    /// `status` must be final and `score` at most `MAX_SCORE`.
    pub fn complete(
        &self,
        id: RecordId,
        status: AssessmentStatus,
        score: Option<u8>,
        actor: &str,
    ) -> Result<Option<ComplianceAssessment>, WardenError> {
        if !status.is_final() {
            return Err(WardenError::InvalidArgument(format!(
                "{} does not conclude an assessment",
                status
            )));
        }
        if score.is_some_and(|s| s > MAX_SCORE) {
            return Err(WardenError::InvalidArgument(format!(
                "score must be at most {}",
                MAX_SCORE
            )));
        }
        let Some(mut assessment) = self.get_by_id(id)? else {
            return Ok(None);
        };
        if assessment.status.is_final() {
            return Err(illegal_transition(
                "assessment",
                assessment.status,
                status,
            ));
        }
        assessment.status = status;
        assessment.score = score;
        self.update(assessment, actor).map(Some)
    }
}
