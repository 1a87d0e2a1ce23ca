//! The host-as-event-loop driving surface: deferral, batch resolution,
//! cancellation, resource limits, and the transpiler round-trip law.

use std::{cell::RefCell, rc::Rc};

use millrace::{
    CallResult, Environment, ErrorKind, LimitedTracker, RenderLimits, RenderOptions, RenderProgress, ResourceTracker,
    TemplateSource, Value, transpile,
};

fn start(src: &str, ctx: Vec<(String, Value)>) -> RenderProgress {
    Environment::new().compile_template(src, None).unwrap().start(ctx, RenderOptions::default()).unwrap()
}

// === Test: deferred calls are answered in any order ===

#[test]
fn batch_resolution_in_reverse_order() {
    let mut progress = start("{{ a() }}-{{ b() }}", vec![]);
    let mut calls = Vec::new();
    let state = loop {
        match progress {
            RenderProgress::FunctionCall { call_id, path, state, .. } => {
                calls.push((call_id, path[0].clone()));
                progress = state.run_pending().unwrap();
            }
            RenderProgress::ResolveFutures(state) => break state,
            other => {
                let _ = other;
                panic!("unexpected progress before resolution");
            }
        }
    };
    assert_eq!(state.pending_call_ids().len(), 2);

    // answer b first, then a; text order stays lexical
    let results = vec![
        (calls[1].0, CallResult::Return(Value::str("B"))),
        (calls[0].0, CallResult::Return(Value::str("A"))),
    ];
    let output = state.resume(results).unwrap().into_complete().expect("complete");
    assert_eq!(output.text(), Some("A-B"));
}

#[test]
fn partial_resolution_keeps_the_rest_pending() {
    let mut progress = start("{{ a() }}{{ b() }}", vec![]);
    let mut calls = Vec::new();
    let state = loop {
        match progress {
            RenderProgress::FunctionCall { call_id, state, .. } => {
                calls.push(call_id);
                progress = state.run_pending().unwrap();
            }
            RenderProgress::ResolveFutures(state) => break state,
            _ => panic!("unexpected progress"),
        }
    };

    let progress = state.resume(vec![(calls[0], CallResult::Return(Value::str("A")))]).unwrap();
    let RenderProgress::ResolveFutures(state) = progress else {
        panic!("one call should remain pending");
    };
    assert_eq!(state.pending_call_ids(), vec![calls[1]]);

    let output = state
        .resume(vec![(calls[1], CallResult::Return(Value::str("B")))])
        .unwrap()
        .into_complete()
        .expect("complete");
    assert_eq!(output.text(), Some("AB"));
}

#[test]
fn double_resolution_of_a_call_id_errors() {
    let progress = start("{{ a() }}", vec![]);
    let RenderProgress::FunctionCall { call_id, state, .. } = progress else {
        panic!("expected a call");
    };
    let err = state
        .resume(vec![
            (call_id, CallResult::Return(Value::str("x"))),
            (call_id, CallResult::Return(Value::str("y"))),
        ])
        .unwrap_err();
    assert!(err.message.contains("already-resolved"), "{}", err.message);
}

// === Test: cancellation ===

#[test]
fn cancel_aborts_with_a_cancelled_error() {
    let progress = start("{{ slow() }}after", vec![]);
    let RenderProgress::FunctionCall { state, .. } = progress else {
        panic!("expected the slow call to surface");
    };
    let exc = state.cancel();
    assert_eq!(exc.kind, ErrorKind::Cancelled);
}

#[test]
fn cancel_releases_sequence_locks() {
    // two calls on one key: the second is queued on the lock when we abort
    let progress = start(
        r#"{{ s!.op(1) ~ s!.op(2) }}"#,
        vec![("s".to_owned(), Value::from_json(serde_json::json!({})))],
    );
    let RenderProgress::FunctionCall { state, .. } = progress else {
        panic!("expected the first call to surface");
    };
    let exc = state.cancel();
    assert_eq!(exc.kind, ErrorKind::Cancelled);
}

// === Test: resource limits ===

#[test]
fn operation_limit_fails_the_render() {
    let tracker: Rc<RefCell<LimitedTracker>> =
        Rc::new(RefCell::new(LimitedTracker::new(RenderLimits::new().max_operations(10))));
    let tracker_dyn: Rc<RefCell<dyn ResourceTracker>> = tracker.clone();
    let template = Environment::new()
        .compile_template("{% var n = 0 %}{% while n < 100 %}{% set n = n + 1 %}{% endwhile %}", None)
        .unwrap();
    let err = template
        .start(vec![], RenderOptions::default().with_tracker(Rc::clone(&tracker_dyn)))
        .unwrap_err();
    assert!(err.message.contains("operation limit"), "{}", err.message);
    assert!(tracker.borrow().operation_count() > 10);
}

#[test]
fn cyclic_includes_hit_the_depth_limit() {
    let mut loader = millrace::MemoryLoader::new();
    loader.add("a.njk", "{% include 'b.njk' %}");
    loader.add("b.njk", "{% include 'a.njk' %}");
    let mut env = Environment::new();
    env.set_loader(loader);
    let err = env
        .render_template_string("{% include 'a.njk' %}", vec![], &mut millrace::NoCallsHost)
        .unwrap_err();
    assert!(err.message.contains("depth limit"), "{}", err.message);
}

// === Test: template loads pause through the host capability ===

#[test]
fn load_pauses_surface_the_template_name() {
    let progress = start("{% include 'part.njk' %}", vec![]);
    let RenderProgress::LoadTemplate { call_id, name, state } = progress else {
        panic!("expected a load pause");
    };
    assert_eq!(name, "part.njk");
    let output = state
        .resume_load(call_id, Some(TemplateSource::new("hi", "part.njk")))
        .unwrap()
        .into_complete()
        .expect("complete");
    assert_eq!(output.text(), Some("hi"));
}

// === Test: transpiler output round trip (template form is final) ===

#[test]
fn transpiling_transpiled_output_is_an_error() {
    let template = transpile("var x = 1\nprint x").unwrap();
    assert!(template.starts_with("{%-"));
    // the template form is not script; feeding it back is a compile error
    let err = transpile(&template).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Syntax);
    assert!(err.message.contains("template tags"), "{}", err.message);
}
