//! # Domain Records
//!
//! Representative record types and their specialized accessors:
//! - `Risk` / `RiskRepository`
//! - `Finding` / `FindingRepository` (child of a risk)
//! - `ComplianceAssessment` / `AssessmentRepository`
//! - `RiskCategory` (plain reference data, served by `BasicRepository`)
//!
//! Specialized accessors wrap `AuditableRepository<T>` and build their
//! query shapes from its public contract only. They deref to it, so every
//! generic operation stays available.
//!
//! Lifecycle tables here are illustrative; they carry no scoring policy.

mod assessment;
mod category;
mod finding;
mod risk;

pub use assessment::{AssessmentRepository, AssessmentStatus, ComplianceAssessment, MAX_SCORE};
pub use category::RiskCategory;
pub use finding::{Finding, FindingRepository, FindingStatus};
pub use risk::{Risk, RiskFilter, RiskRepository, RiskStatus};

use crate::WardenError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Impact rating shared by risks and findings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Severity {
    /// Minor impact.
    #[default]
    Low,
    /// Noticeable impact.
    Medium,
    /// Serious impact.
    High,
    /// Existential impact.
    Critical,
}

impl Severity {
    /// Every severity, lowest first.
    pub const ALL: [Severity; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| WardenError::InvalidArgument(format!("unknown severity '{}'", s)))
    }
}

/// Reject a lifecycle move the status table does not allow.
pub(crate) fn illegal_transition(kind: &str, from: impl fmt::Display, to: impl fmt::Display) -> WardenError {
    WardenError::InvalidState(format!("{} cannot move from {} to {}", kind, from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Severity>().ok(), Some(Severity::High));
        assert!("extreme".parse::<Severity>().is_err());
        assert!(Severity::Critical > Severity::Low);
    }
}
