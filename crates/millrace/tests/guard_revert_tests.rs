//! Poison recovery (`guard`/`recover`) and scope-local `_revert`.

use millrace::{Environment, ErrorKind, FnHost, Output, Value};

/// Host: `boom()` raises, `delayedText(x)` echoes its argument.
fn host() -> FnHost<impl FnMut(&millrace::HostCall<'_>) -> Result<Value, millrace::Exception>> {
    FnHost::new(|call: &millrace::HostCall<'_>| {
        let path: Vec<&str> = call.path().iter().map(String::as_str).collect();
        match path.as_slice() {
            ["boom"] => Err(millrace::Exception::runtime("kaboom")),
            ["delayedText"] => Ok(call.args()[0].clone()),
            other => Err(millrace::Exception::runtime(format!("no host function {}", other.join(".")))),
        }
    })
}

fn render_template(src: &str) -> Result<Output, millrace::Exception> {
    Environment::new().render_template_string(src, vec![], &mut host())
}

fn render_script(src: &str) -> Result<Output, millrace::Exception> {
    Environment::new().render_script_string(src, vec![], &mut host())
}

// === Test: guard transfers control to recover ===

#[test]
fn guard_recovers_from_a_poisoned_call() {
    let out = render_template("{% guard %}a{% do boom() %}{% recover %}E:{{ error }}{% endguard %}!").unwrap();
    let text = out.text().unwrap().to_owned();
    // the body's already-escaped text write stays; only `_revert` undoes it
    assert!(text.starts_with("aE:"), "recover arm renders after the escaped write: {text}");
    assert!(text.contains("kaboom"), "the poison is exposed as `error`: {text}");
    assert!(text.ends_with('!'), "statements after the guard still render: {text}");
}

#[test]
fn guard_recovers_from_a_poisoned_write() {
    let out = render_template("{% guard %}{% set x = boom() %}{% recover %}fallback{% endguard %}").unwrap();
    assert_eq!(out.text(), Some("fallback"));
}

#[test]
fn guard_without_failure_keeps_its_body() {
    let out = render_template("{% guard %}ok{% recover %}bad{% endguard %}").unwrap();
    assert_eq!(out.text(), Some("ok"));
}

#[test]
fn guard_writes_survive_into_the_frame_after_recovery() {
    let out = render_template(
        "{% guard %}{% set x = 'body' %}{% do boom() %}{% recover %}{% set x = 'recovered' %}{% endguard %}{{ x }}",
    )
    .unwrap();
    assert_eq!(out.text(), Some("recovered"));
}

#[test]
fn unguarded_poison_rejects_the_render() {
    let err = render_template("a{% do boom() %}b").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("kaboom"), "{}", err.message);
}

// === Test: revert drops scope writes (scenario S6) ===

#[test]
fn revert_drops_prescheduled_async_writes() {
    let script = ":text\nvar p = delayedText(\"DROP\")\n@text(p)\n@text._revert()\n@text(delayedText(\"KEEP\"))";
    let out = render_script(script).unwrap();
    assert_eq!(out, Output::Text("KEEP".to_owned()));
}

#[test]
fn revert_all_clears_every_handler() {
    let script = ":data\nprint \"gone\"\n@data.x = 1\nrevert\n@data.y = 2";
    let out = render_script(script).unwrap();
    assert_eq!(out.to_json(), serde_json::json!({"y": 2}));
}

#[test]
fn revert_is_idempotent() {
    let script = "print \"a\"\nrevert\nrevert\nprint \"b\"";
    let out = render_script(script).unwrap();
    assert_eq!(out, Output::Text("b".to_owned()));
}

#[test]
fn revert_inside_capture_does_not_touch_the_outer_scope() {
    let script = "\
print \"outer\"
var t = capture
print \"inner\"
revert
print \"kept\"
endcapture
print t";
    let out = render_script(script).unwrap();
    assert_eq!(out, Output::Text("outerkept".to_owned()));
}

#[test]
fn revert_drops_poisoned_writes() {
    // the poisoned chunk is cancelled by the revert, so the render succeeds
    let script = ":text\n@text(boom())\n@text._revert()\nprint \"ok\"";
    let out = render_script(script).unwrap();
    assert_eq!(out, Output::Text("ok".to_owned()));
}

// === Test: guard composed with revert restores pre-guard state ===

#[test]
fn guard_revert_recover_restores_pre_guard_handler_state() {
    let script = "\
:data
@data.keep = 1
guard
@data.lost = 2
do boom()
recover
revert
endguard";
    let out = render_script(script).unwrap();
    assert_eq!(out.to_json(), serde_json::json!({"keep": 1}));
}
