//! Shared scenario utilities.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tap_filter::LocationFilter;
use tap_instrument::{
    EventContext, ExecutionEventListener, Frame, Instrumentation, NodeRef, OutputStream, Throw,
};
use tap_ir::{Tags, Value};
use tap_testlang::{Interpreter, Program};

pub fn setup() -> Interpreter {
    tap_instrument::init_tracing();
    Interpreter::new(Instrumentation::default())
}

pub fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => panic!("unexpected error: {error:?}"),
    }
}

pub fn load(interpreter: &Interpreter, text: &str) -> Program {
    match interpreter.load("scenario.toy", text) {
        Ok(program) => program,
        Err(error) => panic!("load failed: {error}"),
    }
}

pub fn run(interpreter: &Interpreter, name: &str) -> Value {
    match interpreter.run(name) {
        Ok(value) => value,
        Err(thrown) => panic!("{name} threw: {thrown}"),
    }
}

pub fn tagged(tags: Tags) -> LocationFilter {
    must(LocationFilter::builder().tag_is(tags).build())
}

/// Text of the location a context reports.
pub fn text(ctx: &EventContext) -> String {
    ctx.source_section()
        .map(|section| section.text().to_string())
        .unwrap_or_default()
}

#[derive(Default)]
pub struct Log(Mutex<Vec<String>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Logs every hook as `"<name> <hook> <value>"`.
pub struct Named {
    pub name: &'static str,
    pub log: Arc<Log>,
}

impl ExecutionEventListener for Named {
    fn on_enter(&self, _ctx: &EventContext, _frame: &mut Frame) -> Result<(), Throw> {
        self.log.push(format!("{} enter", self.name));
        Ok(())
    }

    fn on_return_value(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        result: &Value,
    ) -> Result<(), Throw> {
        self.log.push(format!("{} return {result}", self.name));
        Ok(())
    }

    fn on_return_exceptional(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        _error: &Throw,
    ) -> Result<(), Throw> {
        self.log.push(format!("{} exceptional", self.name));
        Ok(())
    }
}

pub fn named(name: &'static str, log: &Arc<Log>) -> Arc<Named> {
    Arc::new(Named {
        name,
        log: Arc::clone(log),
    })
}

/// Logs guest output as `"delegate <line>"`, interleaved with hooks.
pub fn log_output(interpreter: &Interpreter, log: &Arc<Log>) {
    let log = Arc::clone(log);
    let listener = move |bytes: &[u8]| {
        let line = String::from_utf8_lossy(bytes);
        log.push(format!("delegate {}", line.trim_end()));
    };
    must(
        interpreter
            .instrumentation()
            .client_instrumenter()
            .attach_output_listener(OutputStream::Stdout, Arc::new(listener)),
    );
}

#[derive(Default)]
pub struct Counter {
    pub enters: AtomicUsize,
    pub returns: AtomicUsize,
}

impl Counter {
    pub fn enters(&self) -> usize {
        self.enters.load(Ordering::Relaxed)
    }

    pub fn returns(&self) -> usize {
        self.returns.load(Ordering::Relaxed)
    }
}

impl ExecutionEventListener for Counter {
    fn on_enter(&self, _ctx: &EventContext, _frame: &mut Frame) -> Result<(), Throw> {
        self.enters.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_return_value(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        _result: &Value,
    ) -> Result<(), Throw> {
        self.returns.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Every wrapper in the tree under `node`.
pub fn wrappers(node: &NodeRef) -> Vec<NodeRef> {
    let mut found = Vec::new();
    collect_wrappers(node, &mut found);
    found
}

fn collect_wrappers(node: &NodeRef, found: &mut Vec<NodeRef>) {
    if node.is_wrapper() {
        found.push(Arc::clone(node));
    }
    for child in node.children() {
        collect_wrappers(&child, found);
    }
}

/// No wrapper wraps a wrapper, and every wrapped node points back at its
/// one wrapper.
pub fn assert_wrapper_shape(root: &NodeRef) {
    for wrapper in wrappers(root) {
        let Some(delegate) = wrapper.delegate() else {
            panic!("wrapper without delegate");
        };
        assert!(!delegate.is_wrapper(), "nested wrapper above {delegate:?}");
        assert!(
            wrapper.parent().is_some_and(|parent| !parent.is_wrapper()),
            "wrapper {wrapper:?} sits under another wrapper"
        );
        assert!(
            delegate.wrapper().is_some_and(|w| Arc::ptr_eq(&w, &wrapper)),
            "{delegate:?} does not point back at its wrapper"
        );
    }
}
