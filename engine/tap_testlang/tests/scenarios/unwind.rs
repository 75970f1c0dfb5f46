//! Unwinds raised by observers and how their targets resolve them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tap_instrument::{
    EventBinding, EventContext, ExecutionEventListener, Frame, Throw, UnwindAction,
};
use tap_ir::{Tags, Value};

use crate::common::{load, log_output, must, run, setup, tagged, text, Log};

/// Logs statements and raises one unwind at `trigger`, addressed to
/// `target`.
struct Raiser {
    log: Arc<Log>,
    trigger: &'static str,
    target: EventBinding,
    raised: AtomicBool,
}

impl ExecutionEventListener for Raiser {
    fn on_enter(&self, ctx: &EventContext, _frame: &mut Frame) -> Result<(), Throw> {
        let at = text(ctx);
        self.log.push(format!("inner enter {at}"));
        if at == self.trigger && !self.raised.swap(true, Ordering::Relaxed) {
            return Err(ctx.create_unwind(Value::Int(9), Some(&self.target)));
        }
        Ok(())
    }

    fn on_return_value(
        &self,
        ctx: &EventContext,
        _frame: &mut Frame,
        result: &Value,
    ) -> Result<(), Throw> {
        self.log.push(format!("inner return {} {result}", text(ctx)));
        Ok(())
    }

    fn on_return_exceptional(
        &self,
        ctx: &EventContext,
        _frame: &mut Frame,
        _error: &Throw,
    ) -> Result<(), Throw> {
        self.log.push(format!("inner exceptional {}", text(ctx)));
        Ok(())
    }
}

/// Answers every unwind addressed to it with `action`.
struct Catcher {
    log: Arc<Log>,
    action: Option<UnwindAction>,
}

impl ExecutionEventListener for Catcher {
    fn on_enter(&self, _ctx: &EventContext, _frame: &mut Frame) -> Result<(), Throw> {
        self.log.push("outer enter");
        Ok(())
    }

    fn on_return_value(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        result: &Value,
    ) -> Result<(), Throw> {
        self.log.push(format!("outer return {result}"));
        Ok(())
    }

    fn on_return_exceptional(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        _error: &Throw,
    ) -> Result<(), Throw> {
        self.log.push("outer exceptional");
        Ok(())
    }

    fn on_unwind(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        info: &Value,
    ) -> Result<Option<UnwindAction>, Throw> {
        self.log.push(format!("outer unwind {info}"));
        Ok(self.action.clone())
    }
}

const NESTED: &str = "(fn main (stmt (call helper)) (stmt 2))
                      (fn helper (stmt (print 1)) (stmt 9))";

/// Attaches a catcher on calls and a raiser on statements that unwinds to
/// the catcher from inside the helper.
fn nested(action: Option<UnwindAction>) -> (tap_testlang::Interpreter, Arc<Log>, EventBinding) {
    let interpreter = setup();
    load(&interpreter, NESTED);
    let log = Arc::new(Log::default());
    log_output(&interpreter, &log);
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let outer = must(instrumenter.attach_execution_listener(
        tagged(Tags::CALL),
        Arc::new(Catcher {
            log: Arc::clone(&log),
            action,
        }),
    ));
    must(instrumenter.attach_execution_listener(
        tagged(Tags::STATEMENT),
        Arc::new(Raiser {
            log: Arc::clone(&log),
            trigger: "(stmt (print 1))",
            target: outer.clone(),
            raised: AtomicBool::new(false),
        }),
    ));
    (interpreter, log, outer)
}

#[test]
fn unwinds_travel_to_their_target() {
    let (interpreter, log, _outer) = nested(Some(UnwindAction::Return(Value::Int(5))));
    assert_eq!(run(&interpreter, "main"), Value::Int(2));
    assert_eq!(
        log.take(),
        vec![
            "inner enter (stmt (call helper))",
            "outer enter",
            "inner enter (stmt (print 1))",
            "inner exceptional (stmt (print 1))",
            "outer unwind 9",
            "inner return (stmt (call helper)) 5",
            "inner enter (stmt 2)",
            "inner return (stmt 2) 2",
        ]
    );
}

#[test]
fn reentering_runs_the_location_again() {
    let (interpreter, log, _outer) = nested(Some(UnwindAction::Reenter));
    assert_eq!(run(&interpreter, "main"), Value::Int(2));
    assert_eq!(
        log.take(),
        vec![
            "inner enter (stmt (call helper))",
            "outer enter",
            "inner enter (stmt (print 1))",
            "inner exceptional (stmt (print 1))",
            "outer unwind 9",
            "outer enter",
            "inner enter (stmt (print 1))",
            "delegate 1",
            "inner return (stmt (print 1)) 1",
            "inner enter (stmt 9)",
            "inner return (stmt 9) 9",
            "outer return 9",
            "inner return (stmt (call helper)) 9",
            "inner enter (stmt 2)",
            "inner return (stmt 2) 2",
        ]
    );
}

#[test]
fn unwinds_nobody_stops_escape_the_program() {
    let (interpreter, log, outer) = nested(None);
    let Err(Throw::Unwind(unwind)) = interpreter.run("main") else {
        panic!("the unwind should escape");
    };
    assert_eq!(unwind.info(), &Value::Int(9));
    assert!(unwind.target() == Some(&outer));
    assert_eq!(
        log.take(),
        vec![
            "inner enter (stmt (call helper))",
            "outer enter",
            "inner enter (stmt (print 1))",
            "inner exceptional (stmt (print 1))",
            "outer unwind 9",
            "inner exceptional (stmt (call helper))",
        ]
    );
}

/// Unwinds to itself on its first enter and answers with `action`.
struct Once {
    name: &'static str,
    log: Arc<Log>,
    action: UnwindAction,
    raised: AtomicBool,
}

impl ExecutionEventListener for Once {
    fn on_enter(&self, ctx: &EventContext, _frame: &mut Frame) -> Result<(), Throw> {
        self.log.push(format!("{} enter", self.name));
        if self.raised.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        Err(ctx.create_unwind(Value::Null, None))
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

    fn on_unwind(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        _info: &Value,
    ) -> Result<Option<UnwindAction>, Throw> {
        self.log.push(format!("{} unwind", self.name));
        Ok(Some(self.action.clone()))
    }
}

#[test]
fn reentering_beats_returning_in_one_round() {
    let interpreter = setup();
    load(&interpreter, "(fn main (stmt (print 4)))");
    let log = Arc::new(Log::default());
    log_output(&interpreter, &log);
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    for (name, action) in [
        ("a", UnwindAction::Return(Value::Int(1))),
        ("b", UnwindAction::Reenter),
    ] {
        must(instrumenter.attach_execution_listener(
            tagged(Tags::STATEMENT),
            Arc::new(Once {
                name,
                log: Arc::clone(&log),
                action,
                raised: AtomicBool::new(false),
            }),
        ));
    }

    assert_eq!(run(&interpreter, "main"), Value::Int(4));
    assert_eq!(
        log.take(),
        vec![
            "a enter",
            "b enter",
            "b unwind",
            "a unwind",
            "a enter",
            "b enter",
            "delegate 4",
            "b return 4",
            "a return 4",
        ]
    );
}

/// Turns guest exceptions at its locations into the value 0.
struct Rescue;

impl ExecutionEventListener for Rescue {
    fn on_return_exceptional(
        &self,
        ctx: &EventContext,
        _frame: &mut Frame,
        error: &Throw,
    ) -> Result<(), Throw> {
        match error {
            Throw::Guest(_) => Err(ctx.create_unwind(Value::Int(0), None)),
            _ => Ok(()),
        }
    }

    fn on_unwind(
        &self,
        _ctx: &EventContext,
        _frame: &mut Frame,
        info: &Value,
    ) -> Result<Option<UnwindAction>, Throw> {
        Ok(Some(UnwindAction::Return(info.clone())))
    }
}

#[test]
fn exceptions_can_be_turned_into_values() {
    let interpreter = setup();
    load(&interpreter, "(fn main (stmt (add 1 (stmt (throw boom)))))");
    assert!(matches!(interpreter.run("main"), Err(Throw::Guest(_))));

    must(
        interpreter
            .instrumentation()
            .client_instrumenter()
            .attach_execution_listener(tagged(Tags::STATEMENT), Arc::new(Rescue)),
    );
    assert_eq!(run(&interpreter, "main"), Value::Int(1));
}
