//! Root pruning, source notifications, subtree replacement and disposal.

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tap_filter::LocationFilter;
use tap_instrument::{
    AllocationFilter, AllocationListener, AttachError, BufferOutputListener,
    ExecuteSourceListener, LoadSourceSectionEvent, OutputStream,
};
use tap_ir::{Source, Tags, Value};
use tap_testlang::{Interpreter, Program};

use crate::common::{load, must, run, setup, tagged, wrappers, Counter};

fn load_as(interpreter: &Interpreter, name: &str, text: &str) -> Program {
    must(interpreter.load(name, text))
}

fn root<'p>(program: &'p Program, name: &str) -> &'p tap_instrument::NodeRef {
    match program.root(name) {
        Some(root) => root,
        None => panic!("{name} missing"),
    }
}

#[test]
fn root_name_filters_leave_other_functions_alone() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt (call helper))) (fn helper (stmt 1))");
    let counter = Arc::new(Counter::default());
    let filter = must(
        LocationFilter::builder()
            .tag_is(Tags::STATEMENT)
            .root_name_is(|name| name == "helper")
            .build(),
    );
    must(
        interpreter
            .instrumentation()
            .client_instrumenter()
            .attach_execution_listener(filter, counter.clone()),
    );

    assert_eq!(run(&interpreter, "main"), Value::Int(1));
    assert_eq!(counter.enters(), 1);
    assert!(wrappers(root(&program, "main")).is_empty());
    assert_eq!(wrappers(root(&program, "helper")).len(), 1);
}

#[test]
fn source_filters_leave_other_sources_alone() {
    let interpreter = setup();
    let first = load_as(&interpreter, "a.toy", "(fn a (stmt 1))");
    let second = load_as(&interpreter, "b.toy", "(fn b (stmt 2))");
    let counter = Arc::new(Counter::default());
    let filter = must(
        LocationFilter::builder()
            .source_is([first.source.clone()])
            .tag_is(Tags::STATEMENT)
            .build(),
    );
    must(
        interpreter
            .instrumentation()
            .client_instrumenter()
            .attach_execution_listener(filter, counter.clone()),
    );

    run(&interpreter, "a");
    run(&interpreter, "b");
    assert_eq!(counter.enters(), 1);
    assert_eq!(wrappers(root(&first, "a")).len(), 1);
    assert!(wrappers(root(&second, "b")).is_empty());
}

fn executed_log() -> (Arc<Mutex<Vec<String>>>, Arc<dyn ExecuteSourceListener>) {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let listener = move |source: &Source| sink.lock().push(source.name().to_string());
    (seen, Arc::new(listener))
}

#[test]
fn sources_are_reported_when_they_first_run() {
    let interpreter = setup();
    load_as(&interpreter, "a.toy", "(fn a (stmt 1))");
    load_as(&interpreter, "b.toy", "(fn b (call a))");
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let (early, listener) = executed_log();
    must(instrumenter.attach_execute_source_listener(LocationFilter::any(), listener, true));
    assert!(early.lock().is_empty(), "nothing ran yet");

    run(&interpreter, "a");
    run(&interpreter, "a");
    assert_eq!(*early.lock(), vec!["a.toy"]);
    run(&interpreter, "b");
    assert_eq!(*early.lock(), vec!["a.toy", "b.toy"]);

    let (late, listener) = executed_log();
    must(instrumenter.attach_execute_source_listener(LocationFilter::any(), listener, true));
    assert_eq!(*late.lock(), vec!["a.toy", "b.toy"]);
}

#[test]
fn replaced_subtrees_are_instrumented_and_reported() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt 1)) (fn spare (stmt 2))");
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let counter = Arc::new(Counter::default());
    must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), counter.clone()));
    let loaded: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&loaded);
    let listener = move |event: &LoadSourceSectionEvent| {
        let text = event.section().map(|s| s.text().to_string()).unwrap_or_default();
        sink.lock().push(text);
    };
    must(instrumenter.attach_source_section_listener(
        tagged(Tags::STATEMENT),
        Arc::new(listener),
        false,
    ));
    assert_eq!(run(&interpreter, "main"), Value::Int(1));

    let main = root(&program, "main");
    let (Some(old), Some(new)) = (
        main.child(0).and_then(|w| w.delegate()),
        root(&program, "spare").child(0),
    ) else {
        panic!("statements missing");
    };
    must(interpreter.replace(&old, new));

    assert_eq!(*loaded.lock(), vec!["(stmt 2)"]);
    assert_eq!(run(&interpreter, "main"), Value::Int(2));
    assert_eq!(counter.enters(), 2);
    assert_eq!(wrappers(main).len(), 1);
}

#[derive(Default)]
struct Quiet;

impl AllocationListener for Quiet {}

#[test]
fn disposing_the_coordinator_stops_every_observer() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt (print (define 0 1))))");
    let instrumentation = interpreter.instrumentation();
    let instrumenter = instrumentation.client_instrumenter();
    let counter = Arc::new(Counter::default());
    let output = Arc::new(BufferOutputListener::new());
    let execution =
        must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), counter.clone()));
    must(instrumenter.attach_output_listener(OutputStream::Stdout, output.clone()));
    must(instrumenter.attach_allocation_listener(AllocationFilter::any(), Arc::new(Quiet)));
    run(&interpreter, "main");
    assert_eq!(output.output_string(), "1\n");
    assert!(instrumentation.allocation_reporter("toy").is_active());

    instrumentation.dispose();
    instrumentation.dispose();
    assert!(instrumentation.is_disposed());
    assert!(execution.is_disposed());
    assert!(!instrumentation.allocation_reporter("toy").is_active());

    run(&interpreter, "main");
    assert_eq!(counter.enters(), 1);
    assert_eq!(output.output_string(), "1\n");
    assert!(wrappers(root(&program, "main")).is_empty());
    assert!(matches!(
        instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), counter.clone()),
        Err(AttachError::Disposed)
    ));
}
