//! Session options.
//!
//! Embedded as the `[session]` table of the CLI's `warden.toml`; every
//! field has a default so partial tables parse.

use crate::WardenError;
use crate::primitives::MAX_PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Per-session behavior switches.
///
/// # Example
///
/// ```toml
/// [session]
/// max_page_size = 200
/// track_queries = true
/// auto_detect_changes = true
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Largest page size `page()` accepts. At most `MAX_PAGE_SIZE`.
    pub max_page_size: usize,
    /// Attach rows returned by queries to the change tracker.
    pub track_queries: bool,
    /// Run change detection before each save and keep saved rows tracked.
    pub auto_detect_changes: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_page_size: MAX_PAGE_SIZE,
            track_queries: true,
            auto_detect_changes: true,
        }
    }
}

impl SessionOptions {
    /// Reject options outside the compiled limits.
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.max_page_size == 0 || self.max_page_size > MAX_PAGE_SIZE {
            return Err(WardenError::InvalidArgument(format!(
                "max_page_size must be within 1..={}, got {}",
                MAX_PAGE_SIZE, self.max_page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SessionOptions::default().validate().is_ok());
    }

    #[test]
    fn page_limit_bounds() {
        let zero = SessionOptions {
            max_page_size: 0,
            ..SessionOptions::default()
        };
        let huge = SessionOptions {
            max_page_size: MAX_PAGE_SIZE + 1,
            ..SessionOptions::default()
        };
        assert!(zero.validate().is_err());
        assert!(huge.validate().is_err());
    }
}
