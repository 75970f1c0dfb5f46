//! Index ranges for index, line and column expressions.

use std::fmt;

use crate::FilterError;

/// Half-open range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexRange {
    start: usize,
    end: usize,
}

impl IndexRange {
    /// Range from `start` inclusive to `end` exclusive.
    pub fn between(start: usize, end: usize) -> Result<IndexRange, FilterError> {
        if end < start {
            return Err(FilterError::InvalidRange { start, end });
        }
        Ok(IndexRange { start, end })
    }

    /// Range of `length` indices from `start`.
    pub fn by_length(start: usize, length: usize) -> Result<IndexRange, FilterError> {
        let end = start
            .checked_add(length)
            .ok_or(FilterError::InvalidRange {
                start,
                end: usize::MAX,
            })?;
        Ok(IndexRange { start, end })
    }

    pub fn start(self) -> usize {
        self.start
    }

    pub fn end(self) -> usize {
        self.end
    }

    /// Whether `[other_start, other_end]` touches this range.
    ///
    /// The other range's end is inclusive, so a section ending exactly where
    /// this range starts still matches.
    pub fn contains(self, other_start: usize, other_end: usize) -> bool {
        self.start <= other_end && other_start < self.end
    }

    /// Fail unless the range starts at 1 or later (lines, columns).
    pub(crate) fn one_based(self, what: &'static str) -> Result<IndexRange, FilterError> {
        if self.start == 0 {
            return Err(FilterError::NotOneBased {
                what,
                start: self.start,
            });
        }
        Ok(self)
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}
