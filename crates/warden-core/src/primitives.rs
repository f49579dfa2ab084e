//! # Layer Constants
//!
//! Fixed limits and starting values shared by every store backend and
//! accessor. Compiled in; not configurable at runtime except where
//! `SessionOptions` says otherwise.

/// First id a store assigns within a record type.
///
/// `RecordId(0)` is reserved for "not yet created".
pub const FIRST_RECORD_ID: u64 = 1;

/// First concurrency token a store hands out.
pub const FIRST_TOKEN: u64 = 1;

/// Page size used when callers do not pick one.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Hard upper bound on page size.
///
/// `SessionOptions::max_page_size` may lower this, never raise it.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Prefix reserved for store-internal tables.
///
/// Record types must not start with it.
pub const RESERVED_TABLE_PREFIX: &str = "_warden";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_consistent() {
        assert!(DEFAULT_PAGE_SIZE <= MAX_PAGE_SIZE);
        assert!(FIRST_RECORD_ID > 0);
    }
}
