//! Sources and source sections.
//!
//! A [`Source`] is compared by identity: two sources built from the same text
//! are still different sources. Sections borrow the identity of their source
//! and answer line/column queries from a line table computed once at
//! construction.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Shared, identity-compared guest source.
#[derive(Clone)]
pub struct Source(Arc<SourceData>);

struct SourceData {
    name: String,
    language: String,
    mime_type: Option<String>,
    internal: bool,
    text: String,
    /// Char offset of the first character of every line.
    line_starts: Vec<usize>,
    char_count: usize,
}

/// Builder for [`Source`].
#[derive(Debug)]
pub struct SourceBuilder {
    name: String,
    language: String,
    text: String,
    mime_type: Option<String>,
    internal: bool,
}

impl SourceBuilder {
    /// Set the MIME type.
    #[must_use]
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Mark the source as internal (runtime library code).
    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    /// Finish the source, computing its line table.
    pub fn build(self) -> Source {
        let mut line_starts = vec![0];
        let mut char_count = 0;
        for (index, ch) in self.text.chars().enumerate() {
            if ch == '\n' {
                line_starts.push(index + 1);
            }
            char_count = index + 1;
        }
        Source(Arc::new(SourceData {
            name: self.name,
            language: self.language,
            mime_type: self.mime_type,
            internal: self.internal,
            text: self.text,
            line_starts,
            char_count,
        }))
    }
}

impl Source {
    /// Start building a source for `language`.
    pub fn builder(
        language: impl Into<String>,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> SourceBuilder {
        SourceBuilder {
            name: name.into(),
            language: language.into(),
            text: text.into(),
            mime_type: None,
            internal: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn language(&self) -> &str {
        &self.0.language
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.0.mime_type.as_deref()
    }

    pub fn is_internal(&self) -> bool {
        self.0.internal
    }

    pub fn text(&self) -> &str {
        &self.0.text
    }

    /// Length of the text in chars.
    pub fn char_count(&self) -> usize {
        self.0.char_count
    }

    pub fn line_count(&self) -> usize {
        self.0.line_starts.len()
    }

    /// Section covering `length` chars from `char_index`.
    ///
    /// Ranges reaching past the end of the text produce an unavailable
    /// section rather than an error; line and column queries on it return 0.
    pub fn section(&self, char_index: usize, length: usize) -> SourceSection {
        let available = char_index
            .checked_add(length)
            .is_some_and(|end| end <= self.0.char_count);
        SourceSection {
            source: self.clone(),
            char_index,
            char_length: length,
            available,
        }
    }

    /// Section covering a whole line (1-based), without its line break.
    pub fn line_section(&self, line: usize) -> SourceSection {
        if line == 0 || line > self.line_count() {
            return self.unavailable_section();
        }
        let start = self.0.line_starts[line - 1];
        let end = self
            .0
            .line_starts
            .get(line)
            .map_or(self.0.char_count, |next| next - 1);
        self.section(start, end - start)
    }

    /// A section that carries this source's identity but no position.
    pub fn unavailable_section(&self) -> SourceSection {
        SourceSection {
            source: self.clone(),
            char_index: 0,
            char_length: 0,
            available: false,
        }
    }

    /// 1-based line containing `char_index`.
    fn line_of(&self, char_index: usize) -> usize {
        self.0.line_starts.partition_point(|&start| start <= char_index)
    }

    /// 1-based column of `char_index` within its line.
    fn column_of(&self, char_index: usize) -> usize {
        let line = self.line_of(char_index);
        char_index - self.0.line_starts[line - 1] + 1
    }

    fn ptr(&self) -> *const SourceData {
        Arc::as_ptr(&self.0)
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Source {}

impl Hash for Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr().hash(state);
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.0.name)
            .field("language", &self.0.language)
            .field("internal", &self.0.internal)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// A contiguous char range of a [`Source`].
#[derive(Clone)]
pub struct SourceSection {
    source: Source,
    char_index: usize,
    char_length: usize,
    available: bool,
}

impl SourceSection {
    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn char_index(&self) -> usize {
        self.char_index
    }

    pub fn char_length(&self) -> usize {
        self.char_length
    }

    /// Exclusive end index.
    pub fn char_end_index(&self) -> usize {
        self.char_index + self.char_length
    }

    pub fn start_line(&self) -> usize {
        if !self.available {
            return 0;
        }
        self.source.line_of(self.char_index)
    }

    pub fn end_line(&self) -> usize {
        if !self.available {
            return 0;
        }
        self.source.line_of(self.last_char())
    }

    pub fn start_column(&self) -> usize {
        if !self.available {
            return 0;
        }
        self.source.column_of(self.char_index)
    }

    pub fn end_column(&self) -> usize {
        if !self.available {
            return 0;
        }
        self.source.column_of(self.last_char())
    }

    /// Whether `other` lies within this section of the same source.
    pub fn contains(&self, other: &SourceSection) -> bool {
        self.source == other.source
            && other.char_index >= self.char_index
            && other.char_end_index() <= self.char_end_index()
    }

    /// Text covered by the section.
    pub fn text(&self) -> &str {
        if !self.available {
            return "";
        }
        let text = self.source.text();
        let start = text
            .char_indices()
            .nth(self.char_index)
            .map_or(text.len(), |(byte, _)| byte);
        let end = text[start..]
            .char_indices()
            .nth(self.char_length)
            .map_or(text.len(), |(byte, _)| start + byte);
        &text[start..end]
    }

    fn last_char(&self) -> usize {
        if self.char_length == 0 {
            self.char_index
        } else {
            self.char_end_index() - 1
        }
    }
}

impl PartialEq for SourceSection {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.available == other.available
            && self.char_index == other.char_index
            && self.char_length == other.char_length
    }
}

impl Eq for SourceSection {}

impl Hash for SourceSection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.char_index.hash(state);
        self.char_length.hash(state);
    }
}

impl fmt::Debug for SourceSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for SourceSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.available {
            return write!(f, "{}:<unavailable>", self.source);
        }
        write!(
            f,
            "{}:{}:{}-{}:{}",
            self.source,
            self.start_line(),
            self.start_column(),
            self.end_line(),
            self.end_column()
        )
    }
}
