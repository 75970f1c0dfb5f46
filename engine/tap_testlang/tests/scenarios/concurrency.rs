//! Attaching, detaching and loading while other threads execute.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rayon::prelude::*;
use tap_filter::LocationFilter;
use tap_instrument::{LoadSourceListener, LoadSourceSectionEvent, LoadSourceSectionListener};
use tap_ir::{Source, Tags, Value};

use crate::common::{assert_wrapper_shape, load, must, run, setup, tagged, wrappers, Counter};

#[test]
fn runs_stay_correct_while_bindings_come_and_go() {
    let interpreter = setup();
    let program = load(
        &interpreter,
        "(fn main (stmt 1) (stmt (call helper)) (stmt (add 3 4)))
         (fn helper (block (stmt 5) (stmt 6)))",
    );
    let Some(main) = program.root("main") else {
        panic!("main missing");
    };
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let counter = Arc::new(Counter::default());
    let results = AtomicUsize::new(0);

    rayon::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|_| {
                for _ in 0..200 {
                    assert_eq!(run(&interpreter, "main"), Value::Int(7));
                    results.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        scope.spawn(|_| {
            for round in 0..25 {
                let tags = if round % 2 == 0 {
                    Tags::STATEMENT
                } else {
                    Tags::STATEMENT | Tags::CALL
                };
                let (filter, calls) = (tagged(tags), tagged(Tags::CALL));
                let first = must(instrumenter.attach_execution_listener(filter, counter.clone()));
                let second = must(instrumenter.attach_execution_listener(calls, counter.clone()));
                first.dispose();
                second.dispose();
            }
        });
    });
    assert_eq!(results.load(Ordering::Relaxed), 4 * 200);

    assert_eq!(run(&interpreter, "main"), Value::Int(7));
    assert_wrapper_shape(main);
    assert!(wrappers(main).is_empty());
}

#[test]
fn concurrent_loads_report_each_source_exactly_once() {
    let interpreter = setup();
    let instrumenter = interpreter.instrumentation().client_instrumenter();
    let names: Arc<Mutex<Vec<String>>> = Arc::default();
    let sections: Arc<Mutex<Vec<String>>> = Arc::default();

    let sources: Arc<dyn LoadSourceListener> = {
        let names = Arc::clone(&names);
        Arc::new(move |source: &Source| names.lock().push(source.name().to_string()))
    };
    let statements: Arc<dyn LoadSourceSectionListener> = {
        let sections = Arc::clone(&sections);
        Arc::new(move |event: &LoadSourceSectionEvent| {
            let text = event.section().map(|s| s.text().to_string()).unwrap_or_default();
            sections.lock().push(text);
        })
    };

    rayon::join(
        || {
            (0..32).into_par_iter().for_each(|i| {
                let text = format!("(fn f{i} (stmt {i}))");
                must(interpreter.load(&format!("s{i}.toy"), &text));
            });
        },
        || {
            must(instrumenter.attach_source_listener(LocationFilter::any(), sources, true));
            must(instrumenter.attach_source_section_listener(
                tagged(Tags::STATEMENT),
                statements,
                true,
            ));
        },
    );

    let mut reported = names.lock().clone();
    reported.sort();
    let mut expected: Vec<String> = (0..32).map(|i| format!("s{i}.toy")).collect();
    expected.sort();
    assert_eq!(reported, expected, "every source exactly once");

    let seen: BTreeSet<String> = sections.lock().iter().cloned().collect();
    let all: BTreeSet<String> = (0..32).map(|i| format!("(stmt {i})")).collect();
    assert_eq!(seen, all, "every statement at least once");
}
