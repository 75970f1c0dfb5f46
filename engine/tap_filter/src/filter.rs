//! The built filter and its builder.

use std::fmt;
use std::sync::Arc;

use tap_ir::{Source, SourceSection, Tags};

use crate::expr::Expr;
use crate::{FilterError, IndexRange, Location, RootSummary};

/// Custom predicate over sources.
#[derive(Clone)]
pub struct SourcePredicate(pub(crate) Arc<dyn Fn(&Source) -> bool + Send + Sync>);

/// Custom predicate over root names.
#[derive(Clone)]
pub struct NamePredicate(pub(crate) Arc<dyn Fn(&str) -> bool + Send + Sync>);

/// Immutable conjunction of filter expressions.
///
/// Cloning is cheap; the expression list is shared.
#[derive(Clone)]
pub struct LocationFilter {
    expressions: Arc<[Expr]>,
}

impl LocationFilter {
    /// Filter matching every location.
    pub fn any() -> LocationFilter {
        LocationFilter {
            expressions: Arc::from(Vec::new()),
        }
    }

    pub fn builder() -> LocationFilterBuilder {
        LocationFilterBuilder::default()
    }

    /// Whether every expression depends on source identity alone.
    ///
    /// Source-only filters can be answered before any tree exists and are the
    /// only filters accepted by source-loaded and source-executed bindings.
    pub fn is_source_only(&self) -> bool {
        self.expressions.iter().all(Expr::is_source_only)
    }

    /// Source-level check for source-only filters.
    pub fn includes_source(&self, source: &Source) -> bool {
        self.expressions.iter().all(|e| e.includes_source(source))
    }

    /// Every tag any expression mentions, negated ones included.
    pub fn referenced_tags(&self) -> Tags {
        let mut tags = Tags::empty();
        for expr in self.expressions.iter() {
            expr.collect_tags(&mut tags);
        }
        tags
    }

    /// Tags a matching node must carry one of, or `None` if the filter does
    /// not restrict tags.
    ///
    /// This is the tag set worth materializing for.
    pub fn limited_tags(&self) -> Option<Tags> {
        let mut limited = None;
        for expr in self.expressions.iter() {
            if let Expr::TagIs(tags) = expr {
                *limited.get_or_insert(Tags::empty()) |= *tags;
            }
        }
        limited
    }

    /// Pre-check against a whole tree.
    pub fn is_root_included(&self, root: &RootSummary<'_>) -> bool {
        self.expressions.iter().all(|e| e.is_root_included(root))
    }

    /// Node-level check, ignoring root-level expressions.
    pub fn is_node_included(&self, location: &Location<'_>) -> bool {
        self.expressions.iter().all(|e| e.is_included(location))
    }

    /// Full check: the root pre-check and the node check.
    pub fn includes(&self, root: &RootSummary<'_>, location: &Location<'_>) -> bool {
        self.is_root_included(root) && self.is_node_included(location)
    }

    pub fn is_any(&self) -> bool {
        self.expressions.is_empty()
    }
}

impl fmt::Display for LocationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocationFilter[")?;
        for (i, expr) in self.expressions.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            write!(f, "{expr}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for LocationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Builder for [`LocationFilter`].
///
/// Methods that take ranges validate them eagerly; the first invalid argument
/// is reported by [`build`](LocationFilterBuilder::build).
pub struct LocationFilterBuilder {
    expressions: Vec<Expr>,
    include_internal: bool,
    error: Option<FilterError>,
}

impl Default for LocationFilterBuilder {
    fn default() -> Self {
        LocationFilterBuilder {
            expressions: Vec::new(),
            include_internal: true,
            error: None,
        }
    }
}

impl LocationFilterBuilder {
    fn push(mut self, expr: Expr) -> Self {
        self.expressions.push(expr);
        self
    }

    fn fail(mut self, error: FilterError) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    fn non_empty<T>(
        self,
        items: Vec<T>,
        expression: &'static str,
        make: impl FnOnce(Box<[T]>) -> Expr,
    ) -> Self {
        if items.is_empty() {
            return self.fail(FilterError::EmptyArguments { expression });
        }
        self.push(make(items.into_boxed_slice()))
    }

    fn ranges(
        self,
        ranges: impl IntoIterator<Item = Result<IndexRange, FilterError>>,
        one_based: Option<&'static str>,
        expression: &'static str,
        make: impl FnOnce(Box<[IndexRange]>) -> Expr,
    ) -> Self {
        let mut collected = Vec::new();
        for range in ranges {
            let checked = match (range, one_based) {
                (Ok(range), Some(what)) => range.one_based(what),
                (result, None) => result,
                (Err(e), Some(_)) => Err(e),
            };
            match checked {
                Ok(range) => collected.push(range),
                Err(e) => return self.fail(e),
            }
        }
        self.non_empty(collected, expression, make)
    }

    /// Match nodes whose section belongs to one of `sources`.
    #[must_use]
    pub fn source_is(self, sources: impl IntoIterator<Item = Source>) -> Self {
        let sources = sources.into_iter().collect();
        self.non_empty(sources, "source_is", Expr::SourceIs)
    }

    /// Match nodes whose section's source satisfies `predicate`.
    #[must_use]
    pub fn source_matches(
        self,
        predicate: impl Fn(&Source) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.push(Expr::SourceMatches(SourcePredicate(Arc::new(predicate))))
    }

    #[must_use]
    pub fn mime_type_is<S: Into<String>>(self, mime_types: impl IntoIterator<Item = S>) -> Self {
        let types = mime_types.into_iter().map(Into::into).collect();
        self.non_empty(types, "mime_type_is", Expr::MimeTypeIs)
    }

    /// Match nodes of roots whose name satisfies `predicate`.
    #[must_use]
    pub fn root_name_is(self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.push(Expr::RootNameIs(NamePredicate(Arc::new(predicate))))
    }

    /// Match nodes carrying any of `tags`.
    #[must_use]
    pub fn tag_is(self, tags: Tags) -> Self {
        if tags.is_empty() {
            return self.fail(FilterError::EmptyArguments { expression: "tag_is" });
        }
        self.push(Expr::TagIs(tags))
    }

    /// Match nodes carrying none of `tags`.
    #[must_use]
    pub fn tag_is_not(self, tags: Tags) -> Self {
        if tags.is_empty() {
            return self.fail(FilterError::EmptyArguments {
                expression: "tag_is_not",
            });
        }
        self.push(Expr::Not(Box::new(Expr::TagIs(tags))))
    }

    #[must_use]
    pub fn source_section_equals(self, sections: impl IntoIterator<Item = SourceSection>) -> Self {
        let sections = sections.into_iter().collect();
        self.non_empty(sections, "source_section_equals", Expr::SectionEquals)
    }

    #[must_use]
    pub fn root_source_section_equals(
        self,
        sections: impl IntoIterator<Item = SourceSection>,
    ) -> Self {
        let sections = sections.into_iter().collect();
        self.non_empty(sections, "root_source_section_equals", Expr::RootSectionEquals)
    }

    /// Match nodes whose char range touches `[start, start + length)`.
    #[must_use]
    pub fn index_in(self, start: usize, length: usize) -> Self {
        self.ranges([IndexRange::by_length(start, length)], None, "index_in", Expr::IndexIn)
    }

    #[must_use]
    pub fn index_in_ranges(self, ranges: impl IntoIterator<Item = IndexRange>) -> Self {
        self.ranges(ranges.into_iter().map(Ok), None, "index_in", Expr::IndexIn)
    }

    #[must_use]
    pub fn index_not_in(self, ranges: impl IntoIterator<Item = IndexRange>) -> Self {
        self.ranges(ranges.into_iter().map(Ok), None, "index_not_in", |r| {
            Expr::Not(Box::new(Expr::IndexIn(r)))
        })
    }

    /// Match nodes spanning any of `length` lines from `start_line`.
    #[must_use]
    pub fn line_in(self, start_line: usize, length: usize) -> Self {
        self.ranges(
            [IndexRange::by_length(start_line, length)],
            Some("line"),
            "line_in",
            Expr::LineIn,
        )
    }

    #[must_use]
    pub fn line_is(self, line: usize) -> Self {
        self.line_in(line, 1)
    }

    #[must_use]
    pub fn line_not_in(self, ranges: impl IntoIterator<Item = IndexRange>) -> Self {
        self.ranges(ranges.into_iter().map(Ok), Some("line"), "line_not_in", |r| {
            Expr::Not(Box::new(Expr::LineIn(r)))
        })
    }

    #[must_use]
    pub fn line_starts_in(self, range: IndexRange) -> Self {
        self.ranges([Ok(range)], Some("line"), "line_starts_in", Expr::LineStartsIn)
    }

    #[must_use]
    pub fn line_ends_in(self, range: IndexRange) -> Self {
        self.ranges([Ok(range)], Some("line"), "line_ends_in", Expr::LineEndsIn)
    }

    #[must_use]
    pub fn column_in(self, start_column: usize, length: usize) -> Self {
        self.ranges(
            [IndexRange::by_length(start_column, length)],
            Some("column"),
            "column_in",
            Expr::ColumnIn,
        )
    }

    #[must_use]
    pub fn column_not_in(self, ranges: impl IntoIterator<Item = IndexRange>) -> Self {
        self.ranges(ranges.into_iter().map(Ok), Some("column"), "column_not_in", |r| {
            Expr::Not(Box::new(Expr::ColumnIn(r)))
        })
    }

    #[must_use]
    pub fn column_starts_in(self, range: IndexRange) -> Self {
        self.ranges([Ok(range)], Some("column"), "column_starts_in", Expr::ColumnStartsIn)
    }

    #[must_use]
    pub fn column_ends_in(self, range: IndexRange) -> Self {
        self.ranges([Ok(range)], Some("column"), "column_ends_in", Expr::ColumnEndsIn)
    }

    /// Whether nodes of internal sources and roots may match (default `true`).
    #[must_use]
    pub fn include_internal(mut self, include: bool) -> Self {
        self.include_internal = include;
        self
    }

    /// Add all expressions of an already built filter.
    #[must_use]
    pub fn and(mut self, filter: &LocationFilter) -> Self {
        self.expressions.extend(filter.expressions.iter().cloned());
        self
    }

    pub fn build(mut self) -> Result<LocationFilter, FilterError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if !self.include_internal {
            self.expressions.push(Expr::IgnoreInternal);
        }
        self.expressions.sort_by_key(Expr::order);
        Ok(LocationFilter {
            expressions: Arc::from(self.expressions),
        })
    }
}
