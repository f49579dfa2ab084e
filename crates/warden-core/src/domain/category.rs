//! Risk categories: reference data without provenance.

use crate::RecordId;
use serde::{Deserialize, Serialize};

/// A grouping label for risks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RiskCategory {
    /// Store-assigned identity.
    pub id: RecordId,
    /// Short unique code, e.g. `OPS`.
    pub code: String,
    /// Display label.
    pub label: String,
}

crate::identifiable_record!(RiskCategory, "risk_categories");

impl RiskCategory {
    /// A new, unsaved category.
    #[must_use]
    pub fn new(code: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: RecordId::UNASSIGNED,
            code: code.into(),
            label: label.into(),
        }
    }
}
