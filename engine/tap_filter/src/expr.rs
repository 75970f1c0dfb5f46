//! Filter expressions.
//!
//! Each variant answers three questions: does a node match, could any node of
//! a root match, and (for source-only variants) does a source match.

use std::fmt;

use tap_ir::{Source, SourceSection, Tags};

use crate::filter::{NamePredicate, SourcePredicate};
use crate::{IndexRange, Location, RootSummary};

#[derive(Clone)]
pub(crate) enum Expr {
    SourceIs(Box<[Source]>),
    SourceMatches(SourcePredicate),
    IgnoreInternal,
    MimeTypeIs(Box<[String]>),
    RootNameIs(NamePredicate),
    TagIs(Tags),
    SectionEquals(Box<[SourceSection]>),
    RootSectionEquals(Box<[SourceSection]>),
    IndexIn(Box<[IndexRange]>),
    LineIn(Box<[IndexRange]>),
    LineStartsIn(Box<[IndexRange]>),
    LineEndsIn(Box<[IndexRange]>),
    ColumnIn(Box<[IndexRange]>),
    ColumnStartsIn(Box<[IndexRange]>),
    ColumnEndsIn(Box<[IndexRange]>),
    Not(Box<Expr>),
}

impl Expr {
    /// Evaluation order; lower runs first.
    pub(crate) fn order(&self) -> u8 {
        match self {
            Expr::SourceIs(_) | Expr::SourceMatches(_) | Expr::IgnoreInternal => 1,
            Expr::MimeTypeIs(_) => 2,
            Expr::RootNameIs(_) => 3,
            Expr::TagIs(_) => 4,
            Expr::SectionEquals(_) | Expr::RootSectionEquals(_) => 6,
            Expr::IndexIn(_) => 8,
            Expr::LineIn(_) | Expr::LineStartsIn(_) | Expr::LineEndsIn(_) => 10,
            Expr::ColumnIn(_) | Expr::ColumnStartsIn(_) | Expr::ColumnEndsIn(_) => 12,
            Expr::Not(inner) => inner.order(),
        }
    }

    /// Whether the expression depends on source identity alone.
    pub(crate) fn is_source_only(&self) -> bool {
        match self {
            Expr::SourceIs(_)
            | Expr::SourceMatches(_)
            | Expr::MimeTypeIs(_)
            | Expr::IgnoreInternal => true,
            Expr::Not(inner) => inner.is_source_only(),
            _ => false,
        }
    }

    pub(crate) fn collect_tags(&self, into: &mut Tags) {
        match self {
            Expr::TagIs(tags) => *into |= *tags,
            Expr::Not(inner) => inner.collect_tags(into),
            _ => {}
        }
    }

    /// Source-level check; only meaningful for source-only expressions.
    pub(crate) fn includes_source(&self, source: &Source) -> bool {
        match self {
            Expr::SourceIs(sources) => sources.iter().any(|s| s == source),
            Expr::SourceMatches(predicate) => (predicate.0)(source),
            Expr::MimeTypeIs(types) => source
                .mime_type()
                .is_some_and(|mime| types.iter().any(|t| t == mime)),
            Expr::IgnoreInternal => !source.is_internal(),
            Expr::Not(inner) => !inner.includes_source(source),
            _ => false,
        }
    }

    pub(crate) fn is_included(&self, location: &Location<'_>) -> bool {
        let section = location.section;
        match self {
            Expr::SourceIs(_) | Expr::SourceMatches(_) | Expr::MimeTypeIs(_) => {
                section.is_some_and(|s| self.includes_source(s.source()))
            }
            Expr::IgnoreInternal => section.map_or(true, |s| !s.source().is_internal()),
            Expr::RootNameIs(_) | Expr::RootSectionEquals(_) => true,
            Expr::TagIs(tags) => location.tags.intersects(*tags),
            Expr::SectionEquals(sections) => section.is_some_and(|s| sections.contains(s)),
            Expr::IndexIn(ranges) => section.is_some_and(|s| index_in(s, ranges)),
            Expr::LineIn(ranges) => section.is_some_and(|s| line_in(s, ranges)),
            Expr::LineStartsIn(ranges) => {
                section.is_some_and(|s| s.is_available() && point_in(s.start_line(), ranges))
            }
            Expr::LineEndsIn(ranges) => {
                section.is_some_and(|s| s.is_available() && point_in(s.end_line(), ranges))
            }
            Expr::ColumnIn(ranges) => section.is_some_and(|s| column_in(s, ranges)),
            Expr::ColumnStartsIn(ranges) => {
                section.is_some_and(|s| s.is_available() && point_in(s.start_column(), ranges))
            }
            Expr::ColumnEndsIn(ranges) => {
                section.is_some_and(|s| s.is_available() && point_in(s.end_column(), ranges))
            }
            Expr::Not(inner) => !inner.is_included(location),
        }
    }

    /// Whether any node below `root` could match.
    ///
    /// Conservative: answers `true` whenever the summary bits do not prove
    /// otherwise.
    pub(crate) fn is_root_included(&self, root: &RootSummary<'_>) -> bool {
        let bits = root.bits;
        match self {
            Expr::SourceIs(_) | Expr::SourceMatches(_) | Expr::MimeTypeIs(_) => {
                if bits.is_no_source_section() {
                    return false;
                }
                match root.section {
                    Some(section) if bits.is_same_source() => {
                        self.includes_source(section.source())
                    }
                    _ => true,
                }
            }
            Expr::IgnoreInternal => !root.internal,
            Expr::RootNameIs(predicate) => (predicate.0)(root.name),
            Expr::TagIs(tags) => root.provided_tags.intersects(*tags),
            Expr::SectionEquals(sections) => section_root_included(sections, root),
            Expr::RootSectionEquals(sections) => {
                root.section.is_some_and(|s| sections.contains(s))
            }
            Expr::IndexIn(ranges) => {
                hierarchical_check(root, |section| index_in(section, ranges))
            }
            Expr::LineIn(ranges) | Expr::LineStartsIn(ranges) | Expr::LineEndsIn(ranges) => {
                hierarchical_check(root, |section| line_in(section, ranges))
            }
            Expr::ColumnIn(ranges) | Expr::ColumnStartsIn(ranges) | Expr::ColumnEndsIn(ranges) => {
                hierarchical_check(root, |section| {
                    if section.start_line() == section.end_line() {
                        column_in(section, ranges)
                    } else {
                        true
                    }
                })
            }
            Expr::Not(_) => true,
        }
    }
}

fn hierarchical_check(root: &RootSummary<'_>, check: impl FnOnce(&SourceSection) -> bool) -> bool {
    if root.bits.is_no_source_section() {
        return false;
    }
    match root.section {
        Some(section) if root.bits.is_hierarchical() => check(section),
        _ => true,
    }
}

fn section_root_included(sections: &[SourceSection], root: &RootSummary<'_>) -> bool {
    if root.bits.is_no_source_section() {
        return false;
    }
    let Some(root_section) = root.section else {
        return true;
    };
    let can_contain = !root.bits.is_same_source()
        || sections.iter().any(|s| s.source() == root_section.source());
    if can_contain && root.bits.is_hierarchical() {
        return sections.iter().any(|s| {
            s.char_index() >= root_section.char_index()
                && s.char_end_index() <= root_section.char_end_index()
        });
    }
    can_contain
}

fn index_in(section: &SourceSection, ranges: &[IndexRange]) -> bool {
    if !section.is_available() {
        return false;
    }
    let start = section.char_index();
    let end = section.char_end_index();
    ranges.iter().any(|r| r.contains(start, end))
}

fn line_in(section: &SourceSection, ranges: &[IndexRange]) -> bool {
    if !section.is_available() {
        return false;
    }
    let (start, end) = (section.start_line(), section.end_line());
    ranges.iter().any(|r| r.contains(start, end))
}

fn column_in(section: &SourceSection, ranges: &[IndexRange]) -> bool {
    if !section.is_available() {
        return false;
    }
    let (start, end) = (section.start_column(), section.end_column());
    ranges.iter().any(|r| r.contains(start, end))
}

fn point_in(point: usize, ranges: &[IndexRange]) -> bool {
    ranges.iter().any(|r| r.contains(point, point))
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str("]")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::SourceIs(sources) => {
                f.write_str("source is ")?;
                write_list(f, sources)
            }
            Expr::SourceMatches(_) => f.write_str("source matches predicate"),
            Expr::IgnoreInternal => f.write_str("ignore internal"),
            Expr::MimeTypeIs(types) => {
                f.write_str("mime-type is one-of ")?;
                write_list(f, types)
            }
            Expr::RootNameIs(_) => f.write_str("root name matches predicate"),
            Expr::TagIs(tags) => write!(f, "tag is one of [{tags}]"),
            Expr::SectionEquals(sections) => {
                f.write_str("source-section equals one-of ")?;
                write_list(f, sections)
            }
            Expr::RootSectionEquals(sections) => {
                f.write_str("root source-section equals one-of ")?;
                write_list(f, sections)
            }
            Expr::IndexIn(ranges) => {
                f.write_str("index-between ")?;
                write_list(f, ranges)
            }
            Expr::LineIn(ranges) => {
                f.write_str("line-between ")?;
                write_list(f, ranges)
            }
            Expr::LineStartsIn(ranges) => {
                f.write_str("line-starts-between ")?;
                write_list(f, ranges)
            }
            Expr::LineEndsIn(ranges) => {
                f.write_str("line-ends-between ")?;
                write_list(f, ranges)
            }
            Expr::ColumnIn(ranges) => {
                f.write_str("column-between ")?;
                write_list(f, ranges)
            }
            Expr::ColumnStartsIn(ranges) => {
                f.write_str("column-starts-between ")?;
                write_list(f, ranges)
            }
            Expr::ColumnEndsIn(ranges) => {
                f.write_str("column-ends-between ")?;
                write_list(f, ranges)
            }
            Expr::Not(inner) => write!(f, "not({inner})"),
        }
    }
}
