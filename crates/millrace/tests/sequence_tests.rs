//! Sequence-marker ordering and the parallelism contract, exercised through
//! the host-as-event-loop API with adversarial resolution orders.

use std::{cell::RefCell, rc::Rc};

use millrace::{
    CallId, CallResult, Environment, ErrorKind, Output, RecordingTracer, RenderOptions, RenderProgress, RenderTracer,
    TraceEvent, Value,
};

/// One call surfaced while driving: id plus the flattened path and first
/// argument, which is all these tests need to identify a site.
#[derive(Debug, Clone, PartialEq)]
struct Surfaced {
    call_id: CallId,
    path: String,
    first_arg: String,
}

/// Drives until the render needs resolutions, collecting surfaced calls
/// along the way (all are deferred).
fn drive_to_resolve(mut progress: RenderProgress) -> (Vec<Surfaced>, millrace::RenderState) {
    let mut surfaced = Vec::new();
    loop {
        match progress {
            RenderProgress::FunctionCall { call_id, path, args, state } => {
                surfaced.push(Surfaced {
                    call_id,
                    path: path.join("."),
                    first_arg: args.first().map(Value::coerce_str).unwrap_or_default(),
                });
                progress = state.run_pending().expect("run_pending");
            }
            RenderProgress::ResolveFutures(state) => return (surfaced, state),
            RenderProgress::Complete(_) => panic!("render completed before any resolution"),
            RenderProgress::LoadTemplate { .. } => panic!("unexpected template load"),
        }
    }
}

/// Resolves the given calls, then keeps driving, collecting further
/// surfaced calls, until completion. Newly surfaced calls are answered with
/// `respond` immediately.
fn finish(
    state: millrace::RenderState,
    resolutions: Vec<(CallId, CallResult)>,
    respond: impl Fn(&Surfaced) -> CallResult,
    order_log: &mut Vec<String>,
) -> Output {
    let mut progress = state.resume(resolutions).expect("resume");
    loop {
        match progress {
            RenderProgress::Complete(output) => return output,
            RenderProgress::FunctionCall { call_id, path, args, state } => {
                let call = Surfaced {
                    call_id,
                    path: path.join("."),
                    first_arg: args.first().map(Value::coerce_str).unwrap_or_default(),
                };
                order_log.push(call.first_arg.clone());
                let result = respond(&call);
                progress = state.resume_call(call_id, result).expect("resume_call");
            }
            RenderProgress::ResolveFutures(_) => panic!("no deferred calls should remain"),
            RenderProgress::LoadTemplate { .. } => panic!("unexpected template load"),
        }
    }
}

fn start(src: &str) -> RenderProgress {
    Environment::new()
        .compile_template(src, Some("seq.njk"))
        .expect("compile")
        .start(vec![("s".to_owned(), Value::dict(millrace::ValueMap::new()))], RenderOptions::default())
        .expect("start")
}

// === Test: shared object-path key serializes in source order ===

#[test]
fn same_key_calls_serialize_in_lexical_order() {
    // both calls share the lock key `s`, so the second is not even issued
    // until the first resolves
    let progress = start(r#"{{ s!.op("1") ~ s!.op("2") }}"#);
    let (surfaced, state) = drive_to_resolve(progress);
    assert_eq!(surfaced.len(), 1, "second call must wait for the first");
    assert_eq!(surfaced[0].first_arg, "1");

    let mut order = Vec::new();
    let output = finish(
        state,
        vec![(surfaced[0].call_id, CallResult::Return(Value::str("result1")))],
        |call| CallResult::Return(Value::from(format!("result{}", call.first_arg))),
        &mut order,
    );
    assert_eq!(order, ["2"], "the second site runs only after the first resolved");
    assert_eq!(output.text(), Some("result1result2"));
}

// === Test: method-specific and object-path keys do not cross ===

#[test]
fn method_key_is_independent_of_object_path_key() {
    // sites 1 and 3 share the object-path key `s`; site 2 uses `s::opA`
    let progress = start(r#"{{ s!.opA("1") }} {{ s.opA!("2") }} {{ s!.opB("3") }}"#);
    let (surfaced, state) = drive_to_resolve(progress);

    let args: Vec<&str> = surfaced.iter().map(|c| c.first_arg.as_str()).collect();
    assert_eq!(args, ["1", "2"], "site 3 shares a key with site 1 and must wait; site 2 is independent");

    // resolve out of order: the independent site first
    let mut order = Vec::new();
    let output = finish(
        state,
        vec![
            (surfaced[1].call_id, CallResult::Return(Value::str("A2"))),
            (surfaced[0].call_id, CallResult::Return(Value::str("A1"))),
        ],
        |_| CallResult::Return(Value::str("B3")),
        &mut order,
    );
    assert_eq!(order, ["3"], "site 3 is issued once site 1 released the key");
    // text order is lexical regardless of resolution order
    assert_eq!(output.text(), Some("A1 A2 B3"));
}

// === Test: unmarked calls run in parallel ===

#[test]
fn unmarked_calls_are_issued_without_waiting() {
    let progress = start(r#"{{ s.op("1") }}{{ s.op("2") }}{{ s.op("3") }}"#);
    let (surfaced, state) = drive_to_resolve(progress);
    let args: Vec<&str> = surfaced.iter().map(|c| c.first_arg.as_str()).collect();
    assert_eq!(args, ["1", "2", "3"], "independent calls all surface before any resolution");

    // resolve in reverse order; output must stay lexical
    let resolutions: Vec<(CallId, CallResult)> = surfaced
        .iter()
        .rev()
        .map(|call| (call.call_id, CallResult::Return(Value::from(format!("r{}", call.first_arg)))))
        .collect();
    let output = finish(state, resolutions, |_| panic!("no further calls"), &mut Vec::new());
    assert_eq!(output.text(), Some("r1r2r3"));
}

// === Test: concurrent loops fan out, sequential loops do not ===

#[test]
fn each_loops_fan_out_iterations() {
    let src = "{% each x in xs %}{{ s.op(x) }}{% endeach %}";
    let progress = Environment::new()
        .compile_template(src, None)
        .unwrap()
        .start(
            vec![
                ("s".to_owned(), Value::dict(millrace::ValueMap::new())),
                ("xs".to_owned(), Value::array(vec![Value::str("a"), Value::str("b"), Value::str("c")])),
            ],
            RenderOptions::default(),
        )
        .unwrap();
    let (surfaced, state) = drive_to_resolve(progress);
    assert_eq!(surfaced.len(), 3, "all iterations issue their calls before any resolution");

    let resolutions: Vec<(CallId, CallResult)> = surfaced
        .iter()
        .rev()
        .map(|call| (call.call_id, CallResult::Return(Value::from(call.first_arg.to_uppercase()))))
        .collect();
    let output = finish(state, resolutions, |_| panic!("no further calls"), &mut Vec::new());
    assert_eq!(output.text(), Some("ABC"), "iteration output positions are preserved");
}

#[test]
fn for_loops_run_iterations_one_at_a_time() {
    let src = "{% for x in xs %}{{ s.op(x) }}{% endfor %}";
    let progress = Environment::new()
        .compile_template(src, None)
        .unwrap()
        .start(
            vec![
                ("s".to_owned(), Value::dict(millrace::ValueMap::new())),
                ("xs".to_owned(), Value::array(vec![Value::str("a"), Value::str("b")])),
            ],
            RenderOptions::default(),
        )
        .unwrap();
    let (surfaced, _state) = drive_to_resolve(progress);
    assert_eq!(surfaced.len(), 1, "the second iteration starts only after the first completes");
    assert_eq!(surfaced[0].first_arg, "a");
}

// === Test: lock acquisition order is observable through the tracer ===

#[test]
fn tracer_records_lock_acquisitions_in_source_order() {
    let tracer: Rc<RefCell<RecordingTracer>> = Rc::new(RefCell::new(RecordingTracer::new()));
    let tracer_dyn: Rc<RefCell<dyn RenderTracer>> = tracer.clone();
    let template = Environment::new().compile_template(r#"{{ s!.a("1") }}{{ s.b!("2") }}"#, None).unwrap();
    let mut progress = template
        .start(
            vec![("s".to_owned(), Value::dict(millrace::ValueMap::new()))],
            RenderOptions::default().with_tracer(Rc::clone(&tracer_dyn)),
        )
        .unwrap();
    loop {
        match progress {
            RenderProgress::Complete(_) => break,
            RenderProgress::FunctionCall { call_id, state, .. } => {
                progress = state.resume_call(call_id, CallResult::Return(Value::str("x"))).unwrap();
            }
            other => {
                progress = match other {
                    RenderProgress::ResolveFutures(state) => state.resume(vec![]).unwrap(),
                    _ => panic!("unexpected progress"),
                };
            }
        }
    }
    let keys = tracer.borrow().acquired_keys();
    assert_eq!(keys, ["s", "s::b"]);
    let released = tracer
        .borrow()
        .events()
        .iter()
        .filter(|e| matches!(e, TraceEvent::LockReleased { .. }))
        .count();
    assert_eq!(released, 2, "every acquired lock is released");
}

// === Test: invalid marker sites reject at compile time ===

#[test]
fn sequence_violations_are_compile_errors() {
    let env = Environment::new();
    for (src, needle) in [
        ("{{ s!.prop }}", "property read"),
        ("{% set s = 1 %}{{ s!.op() }}", "bound by the template"),
        ("{{ s!.a!.op() }}", "multiple"),
        ("{% macro m() %}{{ s!.op() }}{% endmacro %}", "macro"),
    ] {
        let err = env.compile_template(src, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Sequence, "{src}");
        assert!(err.message.contains(needle), "{src}: {}", err.message);
    }
}
