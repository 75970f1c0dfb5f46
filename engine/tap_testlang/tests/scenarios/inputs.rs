//! Factory nodes that capture the values of their input children.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tap_instrument::{
    EventContext, ExecutionEventListener, ExecutionEventNodeFactory, Frame, InputHandle, Throw,
};
use tap_ir::{Tags, Value};
use tap_testlang::Interpreter;

use crate::common::{load, must, run, setup, tagged, Log};

/// Saves every input and logs the saved values on the way out.
struct Capture {
    inputs: InputHandle,
    log: Arc<Log>,
}

impl ExecutionEventListener for Capture {
    fn on_input_value(
        &self,
        _ctx: &EventContext,
        frame: &mut Frame,
        _input: &EventContext,
        index: usize,
        value: &Value,
    ) -> Result<(), Throw> {
        self.inputs.save_input_value(frame, index, value.clone());
        Ok(())
    }

    fn on_return_value(
        &self,
        _ctx: &EventContext,
        frame: &mut Frame,
        result: &Value,
    ) -> Result<(), Throw> {
        let saved = self.inputs.saved_input_values(frame);
        self.log.push(format!("{saved:?} -> {result}"));
        Ok(())
    }

    fn on_return_exceptional(
        &self,
        _ctx: &EventContext,
        frame: &mut Frame,
        _error: &Throw,
    ) -> Result<(), Throw> {
        let saved = self.inputs.saved_input_values(frame);
        self.log.push(format!("{saved:?} threw"));
        Ok(())
    }
}

/// Attaches a capturing factory to every expression; leaves get no node.
fn capture_expressions(interpreter: &Interpreter) -> (Arc<Log>, Arc<AtomicUsize>) {
    let log = Arc::new(Log::default());
    let created = Arc::new(AtomicUsize::new(0));
    let factory: Arc<dyn ExecutionEventNodeFactory> = {
        let log = Arc::clone(&log);
        let created = Arc::clone(&created);
        Arc::new(
            move |_ctx: &EventContext,
                  inputs: &InputHandle|
                  -> Option<Arc<dyn ExecutionEventListener>> {
                if inputs.input_count() == 0 {
                    return None;
                }
                created.fetch_add(1, Ordering::Relaxed);
                Some(Arc::new(Capture {
                    inputs: inputs.clone(),
                    log: Arc::clone(&log),
                }))
            },
        )
    };
    must(interpreter.instrumentation().client_instrumenter().attach_execution_factory_with_inputs(
        tagged(Tags::EXPRESSION),
        tagged(Tags::EXPRESSION),
        factory,
    ));
    (log, created)
}

#[test]
fn operands_reach_their_expression_as_inputs() {
    let interpreter = setup();
    load(&interpreter, "(fn main (stmt (expr (add 1 2))))");
    let (log, created) = capture_expressions(&interpreter);

    for _ in 0..2 {
        assert_eq!(run(&interpreter, "main"), Value::Int(3));
    }
    assert_eq!(
        log.take(),
        vec![
            "[Some(Int(1)), Some(Int(2))] -> 3",
            "[Some(Int(3))] -> 3",
            "[Some(Int(1)), Some(Int(2))] -> 3",
            "[Some(Int(3))] -> 3",
        ]
    );
    assert_eq!(created.load(Ordering::Relaxed), 2, "nodes survive between runs");
}

#[test]
fn partial_inputs_are_visible_when_a_location_throws() {
    let interpreter = setup();
    load(
        &interpreter,
        "(fn main (stmt (expr (add 1 (call boom)))))
         (fn boom (throw no))",
    );
    let (log, _) = capture_expressions(&interpreter);

    assert!(matches!(interpreter.run("main"), Err(Throw::Guest(_))));
    assert_eq!(
        log.take(),
        vec!["[Some(Int(1)), None] threw", "[None] threw"]
    );
}

#[test]
fn created_nodes_can_be_looked_up_after_running() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt (expr (add 1 2))))");
    run(&interpreter, "main");
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let factory: Arc<dyn ExecutionEventNodeFactory> = Arc::new(
        |_ctx: &EventContext, inputs: &InputHandle| -> Option<Arc<dyn ExecutionEventListener>> {
            Some(Arc::new(Capture {
                inputs: inputs.clone(),
                log: Arc::default(),
            }))
        },
    );
    let binding = must(instrumenter.attach_execution_factory(tagged(Tags::EXPRESSION), factory));

    let Some(statement) = program.root("main").and_then(|main| main.child(0)) else {
        panic!("statement missing");
    };
    let Some(expression) = statement.child(0) else {
        panic!("expression missing");
    };
    assert!(expression.is_wrapper(), "materialized expressions are wrapped");
    assert!(instrumenter.lookup_execution_event_node(&expression, &binding).is_none());

    run(&interpreter, "main");
    assert!(instrumenter.lookup_execution_event_node(&expression, &binding).is_some());
}
