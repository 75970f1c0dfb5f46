//! Toy syntax nodes.

use std::any::Any;
use std::sync::Arc;

use tap_instrument::{LanguageInfo, Node, NodeRef, SyntaxNode};
use tap_ir::{SourceSection, Tags};

/// Language id of the toy language.
pub const LANGUAGE_ID: &str = "toy";

/// Tags toy nodes carry, statically or after materialization.
pub const PROVIDED_TAGS: Tags = Tags::STATEMENT
    .union(Tags::CALL)
    .union(Tags::EXPRESSION)
    .union(Tags::READ_VARIABLE)
    .union(Tags::WRITE_VARIABLE)
    .union(Tags::LITERAL);

pub fn language() -> Arc<LanguageInfo> {
    Arc::new(LanguageInfo::new(LANGUAGE_ID, "Toy", PROVIDED_TAGS).with_mime_type("text/x-toy"))
}

/// What a toy node does when evaluated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    /// Children in order; the last value wins.
    Block,
    /// One child, tagged `STATEMENT`.
    Statement,
    Constant(i64),
    /// Sum of two children.
    Add,
    /// Run the function with this name.
    Call(String),
    /// Store the child's value in a local.
    Define(usize),
    Read(usize),
    /// Run the children this many times.
    Loop(u32),
    /// Raise a guest exception with this message.
    Throw(String),
    /// Write the child's value to stdout.
    Print,
    /// Evaluates its child. Materializes into a copy whose operands are
    /// tagged `EXPRESSION`.
    Expression,
}

impl Kind {
    fn static_tags(&self) -> Tags {
        match self {
            Kind::Statement => Tags::STATEMENT,
            Kind::Constant(_) => Tags::LITERAL,
            Kind::Call(_) => Tags::CALL,
            Kind::Define(_) => Tags::WRITE_VARIABLE,
            Kind::Read(_) => Tags::READ_VARIABLE,
            _ => Tags::empty(),
        }
    }

    /// Whether a materialized copy tags this node as an expression.
    fn is_operand(&self) -> bool {
        matches!(
            self,
            Kind::Constant(_) | Kind::Add | Kind::Call(_) | Kind::Read(_) | Kind::Expression
        )
    }
}

/// A toy syntax node.
#[derive(Debug)]
pub struct ToyNode {
    kind: Kind,
    tags: Tags,
    section: SourceSection,
}

impl ToyNode {
    pub fn new(kind: Kind, section: SourceSection) -> Self {
        let tags = kind.static_tags();
        ToyNode { kind, tags, section }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Whether this node came out of a materialization.
    pub fn is_materialized(&self) -> bool {
        self.kind == Kind::Expression && self.tags.contains(Tags::EXPRESSION)
    }
}

impl SyntaxNode for ToyNode {
    fn tags(&self) -> Tags {
        self.tags
    }

    fn source_section(&self) -> Option<&SourceSection> {
        Some(&self.section)
    }

    fn materialize(&self, this: &NodeRef, tags: Tags) -> Option<NodeRef> {
        if self.kind != Kind::Expression
            || self.is_materialized()
            || !tags.contains(Tags::EXPRESSION)
        {
            return None;
        }
        tracing::trace!(section = %self.section, "materializing expression");
        Some(expose(this))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Fresh copy of `node`'s subtree with every operand tagged `EXPRESSION`.
fn expose(node: &NodeRef) -> NodeRef {
    let node = node.delegate().unwrap_or_else(|| Arc::clone(node));
    let children = node
        .children()
        .iter()
        .map(|child| tap_stack::with_stack_headroom(|| expose(child)))
        .collect();
    match node.syntax::<ToyNode>() {
        Some(toy) => {
            let mut tags = toy.tags;
            if toy.kind.is_operand() {
                tags |= Tags::EXPRESSION;
            }
            Node::new_syntax(
                ToyNode {
                    kind: toy.kind.clone(),
                    tags,
                    section: toy.section.clone(),
                },
                children,
            )
        }
        None => node,
    }
}
