//! S-expression reader for the toy language.
//!
//! A program is a sequence of `(fn NAME form...)` definitions. Every form is
//! either an integer literal or a parenthesized `(head arg...)` list; each
//! becomes one node whose source section spans the form's text.
//!
//! ```text
//! (fn main
//!   (stmt (define 0 (add 1 2)))
//!   (stmt (print (read 0))))
//! ```

use tap_instrument::{Node, NodeRef, RootNode};
use tap_ir::{Source, SourceSection};
use thiserror::Error;

use crate::syntax::{language, Kind, ToyNode};

/// Reading a program failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected end of input at {at}")]
    UnexpectedEof { at: usize },

    #[error("expected {expected} at {at}, found {found:?}")]
    Unexpected {
        expected: &'static str,
        found: String,
        at: usize,
    },

    #[error("unknown form `{head}` at {at}")]
    UnknownForm { head: String, at: usize },

    #[error("`{head}` at {at} takes {expected} argument(s), got {found}")]
    Arity {
        head: String,
        expected: usize,
        found: usize,
        at: usize,
    },
}

/// One parsed function: its root node and its name.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub root: NodeRef,
}

/// Parse every function in `source`.
pub fn parse_program(source: &Source) -> Result<Vec<Function>, ParseError> {
    let mut parser = Parser::new(source);
    let mut functions = Vec::new();
    loop {
        parser.cursor.skip_trivia();
        if parser.cursor.is_eof() {
            return Ok(functions);
        }
        functions.push(parser.function()?);
    }
}

/// Char cursor with lookahead.
struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Cursor {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    #[inline]
    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    #[inline]
    fn is_eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    #[inline]
    fn advance(&mut self) {
        self.pos += 1;
    }

    /// Skip whitespace and `;` line comments.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.current() {
            if c == ';' {
                while self.current().is_some_and(|c| c != '\n') {
                    self.advance();
                }
            } else if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Consume a run of atom characters, returning it with its start.
    fn atom(&mut self) -> (usize, String) {
        let start = self.pos;
        while self
            .current()
            .is_some_and(|c| !c.is_whitespace() && c != '(' && c != ')' && c != ';')
        {
            self.advance();
        }
        (start, self.chars[start..self.pos].iter().collect())
    }
}

struct Parser<'a> {
    source: &'a Source,
    cursor: Cursor,
    /// Highest local index the current function touches, plus one.
    locals: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a Source) -> Self {
        Parser {
            source,
            cursor: Cursor::new(source.text()),
            locals: 0,
        }
    }

    fn section(&self, start: usize) -> SourceSection {
        self.source.section(start, self.cursor.pos - start)
    }

    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        self.cursor.skip_trivia();
        match self.cursor.current() {
            Some(c) if c == expected => {
                self.cursor.advance();
                Ok(())
            }
            Some(c) => Err(ParseError::Unexpected {
                expected: if expected == '(' { "`(`" } else { "`)`" },
                found: c.to_string(),
                at: self.cursor.pos,
            }),
            None => Err(ParseError::UnexpectedEof {
                at: self.cursor.pos,
            }),
        }
    }

    fn head(&mut self) -> Result<(usize, String), ParseError> {
        self.cursor.skip_trivia();
        let (at, head) = self.cursor.atom();
        if head.is_empty() {
            return Err(match self.cursor.current() {
                Some(c) => ParseError::Unexpected {
                    expected: "a name",
                    found: c.to_string(),
                    at,
                },
                None => ParseError::UnexpectedEof { at },
            });
        }
        Ok((at, head))
    }

    fn function(&mut self) -> Result<Function, ParseError> {
        let start = self.cursor.pos;
        self.expect('(')?;
        let (at, keyword) = self.head()?;
        if keyword != "fn" {
            return Err(ParseError::Unexpected {
                expected: "`fn`",
                found: keyword,
                at,
            });
        }
        let (_, name) = self.head()?;
        self.locals = 0;
        let body = self.forms()?;
        self.expect(')')?;
        let root = RootNode::new(name.clone(), language())
            .with_section(self.section(start))
            .with_locals(self.locals);
        Ok(Function {
            name,
            root: Node::new_root(root, body),
        })
    }

    /// Forms up to the closing paren of the enclosing list.
    fn forms(&mut self) -> Result<Vec<NodeRef>, ParseError> {
        let mut forms = Vec::new();
        loop {
            self.cursor.skip_trivia();
            match self.cursor.current() {
                Some(')') => return Ok(forms),
                None => {
                    return Err(ParseError::UnexpectedEof {
                        at: self.cursor.pos,
                    })
                }
                Some(_) => forms.push(tap_stack::with_stack_headroom(|| self.form())?),
            }
        }
    }

    fn form(&mut self) -> Result<NodeRef, ParseError> {
        self.cursor.skip_trivia();
        let start = self.cursor.pos;
        if self.cursor.current() != Some('(') {
            let (at, atom) = self.cursor.atom();
            let value = self.integer(at, &atom)?;
            return Ok(Node::new_syntax(
                ToyNode::new(Kind::Constant(value), self.section(start)),
                Vec::new(),
            ));
        }
        self.cursor.advance();
        let (at, head) = self.head()?;
        let Some((kind, arity)) = self.kind_of(&head)? else {
            return Err(ParseError::UnknownForm { head, at });
        };
        let children = self.forms()?;
        if let Some(expected) = arity.filter(|&n| n != children.len()) {
            return Err(ParseError::Arity {
                head,
                expected,
                found: children.len(),
                at,
            });
        }
        self.expect(')')?;
        Ok(Node::new_syntax(ToyNode::new(kind, self.section(start)), children))
    }

    /// Node kind and argument count of a list headed by `head`; the
    /// count is `None` for variadic forms.
    fn kind_of(&mut self, head: &str) -> Result<Option<(Kind, Option<usize>)>, ParseError> {
        let shape = match head {
            "block" => (Kind::Block, None),
            "stmt" => (Kind::Statement, Some(1)),
            "const" => {
                let (at, atom) = self.head()?;
                (Kind::Constant(self.integer(at, &atom)?), Some(0))
            }
            "add" => (Kind::Add, Some(2)),
            "call" => (Kind::Call(self.head()?.1), Some(0)),
            "define" => (Kind::Define(self.local()?), Some(1)),
            "read" => (Kind::Read(self.local()?), Some(0)),
            "loop" => {
                let (at, atom) = self.head()?;
                let count = atom.parse().map_err(|_| ParseError::Unexpected {
                    expected: "a loop count",
                    found: atom.clone(),
                    at,
                })?;
                (Kind::Loop(count), None)
            }
            "throw" => (Kind::Throw(self.head()?.1), Some(0)),
            "print" => (Kind::Print, Some(1)),
            "expr" => (Kind::Expression, Some(1)),
            _ => return Ok(None),
        };
        Ok(Some(shape))
    }

    fn local(&mut self) -> Result<usize, ParseError> {
        let (at, atom) = self.head()?;
        let index: usize = atom.parse().map_err(|_| ParseError::Unexpected {
            expected: "a local index",
            found: atom.clone(),
            at,
        })?;
        self.locals = self.locals.max(index + 1);
        Ok(index)
    }

    fn integer(&self, at: usize, atom: &str) -> Result<i64, ParseError> {
        atom.parse().map_err(|_| ParseError::Unexpected {
            expected: "an integer",
            found: atom.to_string(),
            at,
        })
    }
}
