//! Tree-walking interpreter for the toy language.
//!
//! The interpreter is the engine side of the instrumentation contract: it
//! reports every loaded function with `on_tree_loaded`, reports a function's
//! first call with `on_tree_first_executed`, and hands control to the probe
//! whenever evaluation reaches a wrapper. Children are looked up afresh on
//! every step, so wrappers inserted or removed while a function runs take
//! effect at the next child.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tap_instrument::{
    AllocationReporter, Frame, GuestException, Instrumentation, NodeKind, NodeRef, OutputStream,
    Throw, TreeError,
};
use tap_ir::{Source, Value};
use tap_stack::with_stack_headroom;
use thiserror::Error;

use crate::parse::{parse_program, ParseError};
use crate::syntax::{Kind, ToyNode, LANGUAGE_ID};

/// Loading a program failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("function `{0}` is already defined")]
    Duplicate(String),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// A loaded program.
#[derive(Debug)]
pub struct Program {
    pub source: Source,
    pub roots: Vec<NodeRef>,
}

impl Program {
    /// The root of the function called `name`.
    pub fn root(&self, name: &str) -> Option<&NodeRef> {
        self.roots
            .iter()
            .find(|root| root.as_root().is_some_and(|r| r.name() == name))
    }
}

/// Evaluates toy programs under an [`Instrumentation`] coordinator.
pub struct Interpreter {
    instrumentation: Instrumentation,
    functions: RwLock<FxHashMap<String, NodeRef>>,
    allocations: Arc<AllocationReporter>,
}

impl Interpreter {
    pub fn new(instrumentation: Instrumentation) -> Self {
        let allocations = instrumentation.allocation_reporter(LANGUAGE_ID);
        Interpreter {
            instrumentation,
            functions: RwLock::default(),
            allocations,
        }
    }

    pub fn instrumentation(&self) -> &Instrumentation {
        &self.instrumentation
    }

    /// Parse `text` as the source `name` and load every function in it.
    pub fn load(&self, name: &str, text: &str) -> Result<Program, LoadError> {
        let source = Source::builder(LANGUAGE_ID, name, text)
            .mime_type("text/x-toy")
            .build();
        let functions = parse_program(&source)?;
        {
            let mut registry = self.functions.write();
            for function in &functions {
                if registry.contains_key(&function.name) {
                    return Err(LoadError::Duplicate(function.name.clone()));
                }
            }
            for function in &functions {
                registry.insert(function.name.clone(), Arc::clone(&function.root));
            }
        }
        let roots: Vec<NodeRef> = functions.into_iter().map(|f| f.root).collect();
        for root in &roots {
            self.instrumentation.on_tree_loaded(root)?;
        }
        tracing::debug!(source = name, functions = roots.len(), "loaded program");
        Ok(Program { source, roots })
    }

    /// The root of the loaded function `name`.
    pub fn function(&self, name: &str) -> Option<NodeRef> {
        self.functions.read().get(name).cloned()
    }

    /// Call the function `name` with a fresh frame.
    pub fn run(&self, name: &str) -> Result<Value, Throw> {
        self.call(name)
    }

    /// Swap `node` for `replacement` inside its function and report the
    /// change.
    pub fn replace(&self, node: &NodeRef, replacement: NodeRef) -> Result<(), TreeError> {
        let root = node.root().ok_or(TreeError::NoParent)?;
        let target = node.wrapper().unwrap_or_else(|| Arc::clone(node));
        let replacement = target.replace(replacement)?;
        self.instrumentation.on_subtree_replaced(&root, &replacement)
    }

    fn call(&self, name: &str) -> Result<Value, Throw> {
        let Some(root) = self.function(name) else {
            return Err(GuestException::new(format!("undefined function `{name}`")).into());
        };
        self.instrumentation.on_tree_first_executed(&root)?;
        let mut frame = match root.as_root() {
            Some(root) => root.new_frame(),
            None => Frame::new(0),
        };
        tracing::trace!(function = name, "calling");
        self.eval_children(&root, &mut frame)
    }

    /// Evaluate `node`, going through its probe when it is a wrapper.
    pub fn eval(&self, node: &NodeRef, frame: &mut Frame) -> Result<Value, Throw> {
        with_stack_headroom(|| match node.kind() {
            NodeKind::Wrapper(probe) => {
                let probe = Arc::clone(probe);
                probe.execute(frame, |frame| match node.delegate() {
                    Some(delegate) => self.eval(&delegate, frame),
                    None => Ok(Value::Null),
                })
            }
            NodeKind::Syntax(_) => match node.syntax::<ToyNode>() {
                Some(toy) => self.eval_toy(node, toy, frame),
                None => self.eval_children(node, frame),
            },
            NodeKind::Root(_) => self.eval_children(node, frame),
        })
    }

    fn eval_toy(&self, node: &NodeRef, toy: &ToyNode, frame: &mut Frame) -> Result<Value, Throw> {
        match toy.kind() {
            Kind::Block => self.eval_children(node, frame),
            Kind::Statement | Kind::Expression => self.eval_child(node, 0, frame),
            Kind::Constant(value) => Ok(Value::Int(*value)),
            Kind::Add => {
                let left = self.eval_child(node, 0, frame)?;
                let right = self.eval_child(node, 1, frame)?;
                match (left.as_int(), right.as_int()) {
                    (Some(a), Some(b)) => Ok(Value::Int(a.wrapping_add(b))),
                    _ => Err(GuestException::new(format!(
                        "cannot add {} and {}",
                        left.kind_name(),
                        right.kind_name()
                    ))
                    .into()),
                }
            }
            Kind::Call(name) => self.call(name),
            Kind::Define(index) => {
                let value = self.eval_child(node, 0, frame)?;
                self.report_allocation(&value);
                frame.set_local(*index, value.clone());
                Ok(value)
            }
            Kind::Read(index) => Ok(frame.local(*index)),
            Kind::Loop(count) => {
                let mut last = Value::Null;
                for _ in 0..*count {
                    last = self.eval_children(node, frame)?;
                }
                Ok(last)
            }
            Kind::Throw(message) => Err(GuestException::new(message.clone())
                .with_value(Value::from(message.as_str()))
                .into()),
            Kind::Print => {
                let value = self.eval_child(node, 0, frame)?;
                let line = format!("{value}\n");
                self.instrumentation.write_output(OutputStream::Stdout, line.as_bytes());
                Ok(value)
            }
        }
    }

    fn eval_child(&self, node: &NodeRef, index: usize, frame: &mut Frame) -> Result<Value, Throw> {
        let child = node.child(index).ok_or(TreeError::ChildNotFound)?;
        self.eval(&child, frame)
    }

    /// Children in order; the last value wins.
    fn eval_children(&self, node: &NodeRef, frame: &mut Frame) -> Result<Value, Throw> {
        let mut last = Value::Null;
        let mut index = 0;
        while let Some(child) = node.child(index) {
            last = self.eval(&child, frame)?;
            index += 1;
        }
        Ok(last)
    }

    /// Locals are boxed; tell allocation listeners about the box.
    fn report_allocation(&self, value: &Value) {
        if !self.allocations.is_active() {
            return;
        }
        let size = std::mem::size_of::<Value>() as u64;
        self.allocations.on_enter(value, 0, Some(size));
        self.allocations.on_return_value(value, 0, Some(size));
    }
}
