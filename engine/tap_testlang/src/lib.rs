//! An instrumentable toy language.
//!
//! The toy language exists to drive the instrumentation engine end to end:
//! a small S-expression syntax, a parser that attributes every node to its
//! source text, and a tree-walking [`Interpreter`] that reports tree
//! lifecycle events and runs wrapped nodes through their probes.
//!
//! ```text
//! (fn main
//!   (stmt (define 0 (expr (add 1 2))))
//!   (stmt (print (call helper))))
//! (fn helper (const 42))
//! ```
//!
//! `expr` nodes carry no tags until a binding asks for `EXPRESSION`; they
//! then materialize into a copy whose operands are tagged.

mod interpreter;
mod parse;
mod syntax;

pub use interpreter::{Interpreter, LoadError, Program};
pub use parse::{parse_program, Function, ParseError};
pub use syntax::{language, Kind, ToyNode, LANGUAGE_ID, PROVIDED_TAGS};
