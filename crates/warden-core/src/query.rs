//! # Query Module
//!
//! The composable, lazily evaluated query handle behind every accessor read.
//!
//! - `Query<'q, T>` collects predicates, ordering, a skip/take window and
//!   eager-load relations; nothing touches the store until a terminal
//!   (`to_vec`, `first`, `count`, `any`, `page`, `load`) runs.
//! - Predicates are plain closures over the decoded record.
//! - Rows arrive from the store in id order, and ordering is a stable sort,
//!   so ties keep id order.
//!
//! ## Includes
//!
//! An `Include<T>` names a related record set. Loading runs one store scan
//! per relation, however many primary records matched.

use crate::context::DataContext;
use crate::record::{Identifiable, decode, is_tombstoned};
use crate::store::StoredRow;
use crate::{RecordId, WardenError};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

type Predicate<'q, T> = Box<dyn Fn(&T) -> bool + 'q>;
type Comparator<'q, T> = Box<dyn Fn(&T, &T) -> Ordering + 'q>;
/// Related rows per primary record, in primary order.
type RelationLoader<T> = dyn Fn(&DataContext, &[T]) -> Result<Vec<Vec<StoredRow>>, WardenError>;

// =============================================================================
// PAGING
// =============================================================================

/// One page of an offset-paged read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    /// Records on this page.
    pub items: Vec<T>,
    /// 1-based page number.
    pub page: usize,
    /// Requested page size.
    pub page_size: usize,
    /// Matching records across all pages.
    pub total: usize,
}

impl<T> Page<T> {
    /// Number of pages needed for `total` records.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.total.div_ceil(self.page_size.max(1))
    }

    /// Whether a later page holds records.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages()
    }
}

/// Reject page numbers below 1 and sizes outside `1..=max`.
pub(crate) fn check_page(page: usize, size: usize, max: usize) -> Result<(), WardenError> {
    if page == 0 {
        return Err(WardenError::InvalidArgument(
            "page numbers start at 1".to_string(),
        ));
    }
    if size == 0 || size > max {
        return Err(WardenError::InvalidArgument(format!(
            "page size must be within 1..={}, got {}",
            max, size
        )));
    }
    Ok(())
}

// =============================================================================
// INCLUDES
// =============================================================================

/// A named relation to eager-load alongside primary records of type `T`.
pub struct Include<T> {
    name: &'static str,
    table: &'static str,
    loader: Rc<RelationLoader<T>>,
}

impl<T> Clone for Include<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            table: self.table,
            loader: Rc::clone(&self.loader),
        }
    }
}

impl<T> fmt::Debug for Include<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Include")
            .field("name", &self.name)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl<T: Identifiable> Include<T> {
    /// One-to-many: every `C` whose `parent_of` is the primary's id.
    pub fn children<C: Identifiable>(
        name: &'static str,
        parent_of: impl Fn(&C) -> Option<RecordId> + 'static,
    ) -> Self {
        let loader: Rc<RelationLoader<T>> = Rc::new(
            move |ctx: &DataContext,
                  primaries: &[T]|
                  -> Result<Vec<Vec<StoredRow>>, WardenError> {
                let mut by_parent: BTreeMap<RecordId, Vec<StoredRow>> = BTreeMap::new();
                for row in ctx.scan(C::RECORD_TYPE)? {
                    let child: C = decode(&row)?;
                    if is_tombstoned(&child) {
                        continue;
                    }
                    if let Some(parent) = parent_of(&child) {
                        by_parent.entry(parent).or_default().push(row);
                    }
                }
                Ok(primaries
                    .iter()
                    .map(|p| by_parent.get(&p.id()).cloned().unwrap_or_default())
                    .collect())
            },
        );
        Self {
            name,
            table: C::RECORD_TYPE,
            loader,
        }
    }

    /// Many-to-one: the `P` whose id the primary names in `parent_of`.
    pub fn parent<P: Identifiable>(
        name: &'static str,
        parent_of: impl Fn(&T) -> Option<RecordId> + 'static,
    ) -> Self {
        let loader: Rc<RelationLoader<T>> = Rc::new(
            move |ctx: &DataContext,
                  primaries: &[T]|
                  -> Result<Vec<Vec<StoredRow>>, WardenError> {
                let mut by_id: BTreeMap<RecordId, StoredRow> = BTreeMap::new();
                for row in ctx.scan(P::RECORD_TYPE)? {
                    let parent: P = decode(&row)?;
                    if !is_tombstoned(&parent) {
                        by_id.insert(row.id, row);
                    }
                }
                Ok(primaries
                    .iter()
                    .map(|p| {
                        parent_of(p)
                            .and_then(|id| by_id.get(&id).cloned())
                            .into_iter()
                            .collect()
                    })
                    .collect())
            },
        );
        Self {
            name,
            table: P::RECORD_TYPE,
            loader,
        }
    }

    /// Relation name used to read the rows back.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone)]
struct Related {
    table: &'static str,
    rows: Vec<StoredRow>,
}

/// A primary record with its eager-loaded relations.
///
/// Related rows are decoded on demand and are never tracked.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    /// The primary record.
    pub record: T,
    related: BTreeMap<&'static str, Related>,
}

impl<T> Loaded<T> {
    fn relation<C: Identifiable>(&self, name: &str) -> Result<&Related, WardenError> {
        let related = self.related.get(name).ok_or_else(|| {
            WardenError::InvalidArgument(format!("relation '{}' was not included", name))
        })?;
        if related.table != C::RECORD_TYPE {
            return Err(WardenError::InvalidArgument(format!(
                "relation '{}' holds {} records, not {}",
                name,
                related.table,
                C::RECORD_TYPE
            )));
        }
        Ok(related)
    }

    /// Decode a one-to-many relation.
    pub fn related<C: Identifiable>(&self, name: &str) -> Result<Vec<C>, WardenError> {
        self.relation::<C>(name)?.rows.iter().map(decode).collect()
    }

    /// Decode a many-to-one relation.
    pub fn related_one<P: Identifiable>(&self, name: &str) -> Result<Option<P>, WardenError> {
        self.relation::<P>(name)?
            .rows
            .first()
            .map(decode)
            .transpose()
    }

    /// Number of related rows loaded under `name` (0 if not included).
    #[must_use]
    pub fn related_count(&self, name: &str) -> usize {
        self.related.get(name).map_or(0, |r| r.rows.len())
    }

    /// Drop the relations.
    pub fn into_record(self) -> T {
        self.record
    }
}

// =============================================================================
// QUERY HANDLE
// =============================================================================

/// A lazily evaluated read over one record type.
pub struct Query<'q, T: Identifiable> {
    ctx: DataContext,
    /// Restrict to one id (point read instead of a scan).
    only: Option<RecordId>,
    filters: Vec<Predicate<'q, T>>,
    order: Vec<Comparator<'q, T>>,
    skip: usize,
    take: Option<usize>,
    includes: Vec<Include<T>>,
    with_deleted: bool,
    tracking: bool,
}

impl<T: Identifiable> fmt::Debug for Query<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("record_type", &T::RECORD_TYPE)
            .field("only", &self.only)
            .field("filters", &self.filters.len())
            .field("order_keys", &self.order.len())
            .field("skip", &self.skip)
            .field("take", &self.take)
            .field("includes", &self.includes)
            .field("with_deleted", &self.with_deleted)
            .field("tracking", &self.tracking)
            .finish()
    }
}

impl<'q, T: Identifiable> Query<'q, T> {
    pub(crate) fn new(ctx: DataContext) -> Self {
        let tracking = ctx.options().track_queries;
        Self {
            ctx,
            only: None,
            filters: Vec::new(),
            order: Vec::new(),
            skip: 0,
            take: None,
            includes: Vec::new(),
            with_deleted: false,
            tracking,
        }
    }

    pub(crate) fn for_id(mut self, id: RecordId) -> Self {
        self.only = Some(id);
        self
    }

    /// Keep records matching `predicate`. Filters combine with AND.
    #[must_use]
    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + 'q) -> Self {
        self.filters.push(Box::new(predicate));
        self
    }

    /// Sort by `key`, replacing any earlier ordering.
    #[must_use]
    pub fn order_by<K: Ord + 'q>(mut self, key: impl Fn(&T) -> K + 'q, ascending: bool) -> Self {
        self.order.clear();
        self.then_by(key, ascending)
    }

    /// Add a tie-breaking sort key.
    #[must_use]
    pub fn then_by<K: Ord + 'q>(mut self, key: impl Fn(&T) -> K + 'q, ascending: bool) -> Self {
        self.order.push(Box::new(move |a, b| {
            let ord = key(a).cmp(&key(b));
            if ascending { ord } else { ord.reverse() }
        }));
        self
    }

    /// Skip the first `n` matches.
    #[must_use]
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Return at most `n` matches.
    #[must_use]
    pub fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    /// Eager-load a relation (used by `load`).
    #[must_use]
    pub fn include(mut self, include: Include<T>) -> Self {
        self.includes.push(include);
        self
    }

    /// Also return tombstoned records.
    #[must_use]
    pub fn with_deleted(mut self) -> Self {
        self.with_deleted = true;
        self
    }

    /// Do not attach results to the change tracker.
    #[must_use]
    pub fn as_no_tracking(mut self) -> Self {
        self.tracking = false;
        self
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Filtered and ordered matches, before the skip/take window.
    fn matching(&self) -> Result<Vec<(StoredRow, T)>, WardenError> {
        let rows = match self.only {
            Some(id) => self.ctx.get(T::RECORD_TYPE, id)?.into_iter().collect(),
            None => self.ctx.scan(T::RECORD_TYPE)?,
        };

        let mut matched = Vec::new();
        for row in rows {
            let record: T = decode(&row)?;
            if !self.with_deleted && is_tombstoned(&record) {
                continue;
            }
            if self.filters.iter().all(|f| f(&record)) {
                matched.push((row, record));
            }
        }

        if !self.order.is_empty() {
            matched.sort_by(|(_, a), (_, b)| {
                self.order
                    .iter()
                    .fold(Ordering::Equal, |acc, cmp| acc.then_with(|| cmp(a, b)))
            });
        }
        Ok(matched)
    }

    fn windowed(&self) -> Result<Vec<(StoredRow, T)>, WardenError> {
        let take = self.take.unwrap_or(usize::MAX);
        Ok(self
            .matching()?
            .into_iter()
            .skip(self.skip)
            .take(take)
            .collect())
    }

    fn finish(&self, rows: Vec<(StoredRow, T)>) -> Vec<T> {
        if self.tracking {
            self.ctx
                .track(T::RECORD_TYPE, rows.iter().map(|(row, _)| row));
        }
        rows.into_iter().map(|(_, record)| record).collect()
    }

    // -------------------------------------------------------------------------
    // Terminals
    // -------------------------------------------------------------------------

    /// Run the query.
    pub fn to_vec(self) -> Result<Vec<T>, WardenError> {
        let rows = self.windowed()?;
        Ok(self.finish(rows))
    }

    /// First match, if any.
    pub fn first(mut self) -> Result<Option<T>, WardenError> {
        self.take = Some(self.take.map_or(1, |n| n.min(1)));
        Ok(self.to_vec()?.into_iter().next())
    }

    /// Number of matches inside the skip/take window.
    pub fn count(self) -> Result<usize, WardenError> {
        Ok(self.windowed()?.len())
    }

    /// Whether anything matches.
    pub fn any(self) -> Result<bool, WardenError> {
        Ok(self.count()? > 0)
    }

    /// Offset page `page` (1-based) of `page_size` matches.
    ///
    /// Page k of size p holds matches `[(k-1)*p, min(k*p, total))`.
    pub fn page(self, page: usize, page_size: usize) -> Result<Page<T>, WardenError> {
        check_page(page, page_size, self.ctx.options().max_page_size)?;

        let window = self.windowed()?;
        let total = window.len();
        let offset = (page - 1).saturating_mul(page_size);
        let rows = window.into_iter().skip(offset).take(page_size).collect();
        Ok(Page {
            items: self.finish(rows),
            page,
            page_size,
            total,
        })
    }

    /// Run the query and eager-load every included relation.
    pub fn load(self) -> Result<Vec<Loaded<T>>, WardenError> {
        let rows = self.windowed()?;
        let records = self.finish(rows);

        let mut relations = Vec::with_capacity(self.includes.len());
        for include in &self.includes {
            let per_record = (include.loader)(&self.ctx, &records)?;
            relations.push((include.name, include.table, per_record));
        }

        let mut loaded: Vec<Loaded<T>> = records
            .into_iter()
            .map(|record| Loaded {
                record,
                related: BTreeMap::new(),
            })
            .collect();
        for (name, table, per_record) in relations {
            for (item, rows) in loaded.iter_mut().zip(per_record) {
                item.related.insert(name, Related { table, rows });
            }
        }
        Ok(loaded)
    }
}

// =============================================================================
// TESTS
// =============================================================================
