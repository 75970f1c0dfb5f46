//! Load notifications, ordering, disposal and wrapper shape.

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tap_instrument::{
    AllocationFilter, AllocationListener, EventContext, ExecutionEventListener, Frame,
    LoadSourceSectionEvent, LoadSourceSectionListener, Throw, UnwindAction,
};
use tap_ir::{Tags, Value};

use crate::common::{
    assert_wrapper_shape, load, log_output, must, named, run, setup, tagged, wrappers, Counter,
    Log,
};

fn section_log() -> (Arc<Mutex<Vec<String>>>, Arc<dyn LoadSourceSectionListener>) {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let listener = move |event: &LoadSourceSectionEvent| {
        let text = event.section().map(|s| s.text().to_string()).unwrap_or_default();
        sink.lock().push(text);
    };
    (seen, Arc::new(listener))
}

#[test]
fn loaded_locations_are_reported_once_per_binding() {
    let interpreter = setup();
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let (early, listener) = section_log();
    must(instrumenter.attach_source_section_listener(tagged(Tags::STATEMENT), listener, true));

    load(
        &interpreter,
        "(fn main
           (stmt 1)
           (stmt (add 2 3))
           (block (stmt 4) (const 5)))",
    );
    let statements = vec!["(stmt 1)", "(stmt (add 2 3))", "(stmt 4)"];
    assert_eq!(*early.lock(), statements);

    let (late, listener) = section_log();
    must(instrumenter.attach_source_section_listener(tagged(Tags::STATEMENT), listener, true));
    assert_eq!(*late.lock(), statements);

    run(&interpreter, "main");
    load(&interpreter, "(fn other (stmt 6) (add 7 8))");
    let mut expected = statements.clone();
    expected.push("(stmt 6)");
    assert_eq!(*early.lock(), expected);
    assert_eq!(*late.lock(), expected);
}

#[test]
fn enter_follows_attachment_order_and_return_reverses_it() {
    let interpreter = setup();
    load(&interpreter, "(fn main (stmt (call helper)) (stmt 2)) (fn helper 1)");
    let log = Arc::new(Log::default());
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), named("b1", &log)));
    must(instrumenter.attach_execution_listener(tagged(Tags::CALL), named("b2", &log)));
    must(instrumenter.attach_execution_listener(
        tagged(Tags::STATEMENT | Tags::CALL),
        named("b3", &log),
    ));

    run(&interpreter, "main");
    assert_eq!(
        log.take(),
        vec![
            "b1 enter",
            "b3 enter",
            "b2 enter",
            "b3 enter",
            "b3 return 1",
            "b2 return 1",
            "b3 return 1",
            "b1 return 1",
            "b1 enter",
            "b3 enter",
            "b3 return 2",
            "b1 return 2",
        ]
    );
}

#[test]
fn two_listeners_wrap_the_delegate() {
    let interpreter = setup();
    load(&interpreter, "(fn main (stmt (print 1)))");
    let log = Arc::new(Log::default());
    log_output(&interpreter, &log);
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), named("L1", &log)));
    must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), named("L2", &log)));

    run(&interpreter, "main");
    assert_eq!(
        log.take(),
        vec!["L1 enter", "L2 enter", "delegate 1", "L2 return 1", "L1 return 1"]
    );
}

#[test]
fn statement_enters_are_counted_exactly() {
    let interpreter = setup();
    load(
        &interpreter,
        "(fn main
           (stmt 1)
           (block (stmt 2) (stmt 3))
           (stmt 4)
           (loop 1 (stmt 5))
           (add 6 7))",
    );
    let counter = Arc::new(Counter::default());
    must(
        interpreter
            .instrumentation()
            .client_instrumenter()
            .attach_execution_listener(tagged(Tags::STATEMENT), counter.clone()),
    );
    run(&interpreter, "main");
    assert_eq!(counter.enters(), 5);
    assert_eq!(counter.returns(), 5);
}

#[derive(Default)]
struct Quiet;

impl AllocationListener for Quiet {}

#[test]
fn disposing_twice_is_harmless() {
    let interpreter = setup();
    load(&interpreter, "(fn main (stmt (define 0 1)))");
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let counter = Arc::new(Counter::default());
    let execution =
        must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), counter.clone()));
    let first =
        must(instrumenter.attach_allocation_listener(AllocationFilter::any(), Arc::new(Quiet)));
    let second =
        must(instrumenter.attach_allocation_listener(AllocationFilter::any(), Arc::new(Quiet)));
    let reporter = interpreter.instrumentation().allocation_reporter("toy");

    first.dispose();
    first.dispose();
    assert!(first.is_disposed());
    assert!(reporter.is_active(), "the second binding still counts");
    second.dispose();
    assert!(!reporter.is_active());

    run(&interpreter, "main");
    execution.dispose();
    execution.dispose();
    run(&interpreter, "main");
    assert_eq!(counter.enters(), 1);
}

/// Unwinds from its enter and forces the location to return a value.
struct ReturnEarly {
    log: Arc<Log>,
}

impl ExecutionEventListener for ReturnEarly {
    fn on_enter(&self, ctx: &EventContext, _frame: &mut Frame) -> Result<(), Throw> {
        self.log.push("t enter");
        Err(ctx.create_unwind(Value::Int(7), None))
    }

    fn on_unwind(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        info: &Value,
    ) -> Result<Option<UnwindAction>, Throw> {
        self.log.push(format!("t unwind {info}"));
        Ok(Some(UnwindAction::Return(Value::Int(42))))
    }
}

#[test]
fn forced_returns_skip_the_delegate() {
    let interpreter = setup();
    load(&interpreter, "(fn main (stmt (print 1)))");
    let log = Arc::new(Log::default());
    log_output(&interpreter, &log);
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), named("o", &log)));
    must(instrumenter.attach_execution_listener(
        tagged(Tags::STATEMENT),
        Arc::new(ReturnEarly {
            log: Arc::clone(&log),
        }),
    ));

    assert_eq!(run(&interpreter, "main"), Value::Int(42));
    assert_eq!(
        log.take(),
        vec!["o enter", "t enter", "t unwind 7", "o return 42"]
    );
}

#[test]
fn detached_listeners_stop_hearing_and_leave_no_wrapper() {
    let interpreter = setup();
    let program = load(&interpreter, "(fn main (stmt 1) (stmt (add 1 1)))");
    let log = Arc::new(Log::default());
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let statements = tagged(Tags::STATEMENT);
    let l1 = must(instrumenter.attach_execution_listener(statements.clone(), named("L1", &log)));
    let l2 = must(instrumenter.attach_execution_listener(statements, named("L2", &log)));
    for _ in 0..3 {
        run(&interpreter, "main");
    }
    assert_eq!(log.take().len(), 3 * 2 * 4);

    l1.dispose();
    run(&interpreter, "main");
    assert_eq!(
        log.take(),
        vec!["L2 enter", "L2 return 1", "L2 enter", "L2 return 2"]
    );

    let Some(root) = program.root("main") else {
        panic!("main missing");
    };
    assert_eq!(wrappers(root).len(), 2);
    l2.dispose();
    run(&interpreter, "main");
    assert!(log.take().is_empty());
    assert!(wrappers(root).is_empty());
}

#[test]
fn wrappers_stay_unique_through_attach_and_detach() {
    let interpreter = setup();
    let program = load(
        &interpreter,
        "(fn main (stmt (call helper)) (stmt (expr (add 1 2)))) (fn helper (stmt 3))",
    );
    let (Some(main), Some(helper)) = (program.root("main"), program.root("helper")) else {
        panic!("functions missing");
    };
    let check = || {
        assert_wrapper_shape(main);
        assert_wrapper_shape(helper);
    };
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let counter = Arc::new(Counter::default());

    let statements =
        must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), counter.clone()));
    run(&interpreter, "main");
    check();
    let calls = must(instrumenter.attach_execution_listener(
        tagged(Tags::STATEMENT | Tags::CALL),
        counter.clone(),
    ));
    check();
    let expressions =
        must(instrumenter.attach_execution_listener(tagged(Tags::EXPRESSION), counter.clone()));
    check();
    assert_eq!(run(&interpreter, "main"), Value::Int(3));
    check();
    statements.dispose();
    let again =
        must(instrumenter.attach_execution_listener(tagged(Tags::STATEMENT), counter.clone()));
    run(&interpreter, "main");
    check();

    for binding in [calls, expressions, again] {
        binding.dispose();
    }
    run(&interpreter, "main");
    check();
    assert!(wrappers(main).is_empty());
    assert!(wrappers(helper).is_empty());
}
