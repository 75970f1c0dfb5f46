//! Expressions that materialize when a binding asks for their operands.

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tap_instrument::{LoadSourceSectionEvent, NodeRef};
use tap_ir::{Tags, Value};
use tap_testlang::ToyNode;

use crate::common::{assert_wrapper_shape, load, must, run, setup, tagged, wrappers, Counter};

/// The `expr` node under main's first statement, wrapped or not.
fn expression(main: &NodeRef) -> NodeRef {
    let Some(node) = main.child(0).and_then(|statement| statement.child(0)) else {
        panic!("expression missing");
    };
    node.delegate().unwrap_or(node)
}

fn is_materialized(node: &NodeRef) -> bool {
    node.syntax::<ToyNode>().is_some_and(ToyNode::is_materialized)
}

#[test]
fn loaded_operands_are_reported_after_materializing() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt (expr (add 1 2))))");
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let listener = move |event: &LoadSourceSectionEvent| {
        let text = event.section().map(|s| s.text().to_string()).unwrap_or_default();
        sink.lock().push(text);
    };
    must(
        interpreter
            .instrumentation()
            .client_instrumenter()
            .attach_source_section_listener(tagged(Tags::EXPRESSION), Arc::new(listener), true),
    );

    assert_eq!(*seen.lock(), vec!["(expr (add 1 2))", "(add 1 2)", "1", "2"]);
    let Some(main) = program.root("main") else {
        panic!("main missing");
    };
    assert!(is_materialized(&expression(main)));
    assert!(wrappers(main).is_empty(), "loading alone wraps nothing");
    assert_eq!(run(&interpreter, "main"), Value::Int(3));
}

#[test]
fn materialization_happens_once() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt (expr (add 1 2))))");
    let Some(main) = program.root("main") else {
        panic!("main missing");
    };
    run(&interpreter, "main");
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let counter = Arc::new(Counter::default());

    must(instrumenter.attach_execution_listener(tagged(Tags::EXPRESSION), counter.clone()));
    let first = expression(main);
    assert!(is_materialized(&first));
    must(instrumenter.attach_execution_listener(tagged(Tags::EXPRESSION), counter.clone()));
    assert!(Arc::ptr_eq(&first, &expression(main)));
    assert_wrapper_shape(main);

    assert_eq!(run(&interpreter, "main"), Value::Int(3));
    assert_eq!(counter.enters(), 2 * 4);
}

#[test]
fn retired_nodes_keep_their_location_wrapped() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt (expr (add 1 2))))");
    let Some(main) = program.root("main") else {
        panic!("main missing");
    };
    run(&interpreter, "main");
    let old = expression(main);
    assert!(!is_materialized(&old));

    let counter = Arc::new(Counter::default());
    let binding = must(
        interpreter
            .instrumentation()
            .client_instrumenter()
            .attach_execution_listener(tagged(Tags::EXPRESSION), counter.clone()),
    );
    let fresh = expression(main);
    assert!(!Arc::ptr_eq(&old, &fresh));
    assert!(old.wrapper().is_none(), "the retired copy is not wrapped");
    assert_eq!(run(&interpreter, "main"), Value::Int(3));
    assert_eq!(counter.enters(), 4);

    binding.dispose();
    assert_eq!(run(&interpreter, "main"), Value::Int(3));
    let remaining = wrappers(main);
    assert_eq!(remaining.len(), 1, "only the location with a live retired node");
    assert!(remaining[0].delegate().is_some_and(|node| Arc::ptr_eq(&node, &fresh)));
    drop(old);
}
