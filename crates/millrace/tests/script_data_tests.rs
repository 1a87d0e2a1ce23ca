//! The script surface end-to-end: data assembly, focus, capture, operator
//! shorthand, and the boundary laws of the data handler.

use millrace::{Environment, ErrorKind, FnHost, NoCallsHost, Output, Value};
use pretty_assertions::assert_eq;

/// Runs a script with a host that serves `fetchData("users" | "config")`.
fn run_script(src: &str) -> Output {
    let env = Environment::new();
    let mut host = FnHost::new(|call: &millrace::HostCall<'_>| {
        let path: Vec<&str> = call.path().iter().map(String::as_str).collect();
        match path.as_slice() {
            ["fetchData"] => {
                let which = call.args()[0].coerce_str();
                let json = match which.as_str() {
                    "users" => serde_json::json!([{"id": 1, "name": "A"}, {"id": 2, "name": "B"}]),
                    "config" => serde_json::json!({"theme": "dark", "version": "1.5"}),
                    other => return Err(millrace::Exception::runtime(format!("unknown dataset {other}"))),
                };
                Ok(Value::from_json(json))
            }
            other => Err(millrace::Exception::runtime(format!("no host function {}", other.join(".")))),
        }
    });
    env.render_script_string(src, vec![], &mut host).unwrap()
}

fn run_script_json(src: &str) -> serde_json::Value {
    run_script(src).to_json()
}

// === Test: parallel fetch with data assembly (scenario S1) ===

#[test]
fn parallel_fetch_with_data_assembly() {
    let script = "\
:data
var u=fetchData(\"users\")
var c=fetchData(\"config\")
@data.result.users.set(u)
@data.result.config.merge(c)
@data.result.config.loaded.set(true)
@data.result.log.push(\"Data fetch complete\")";
    let expected = serde_json::json!({
        "result": {
            "users": [{"id": 1, "name": "A"}, {"id": 2, "name": "B"}],
            "config": {"theme": "dark", "version": "1.5", "loaded": true},
            "log": ["Data fetch complete"]
        }
    });
    assert_eq!(run_script_json(script), expected);
}

// === Test: capture with focus (scenario S5) ===

#[test]
fn capture_with_data_focus() {
    let script = "\
:data
var u = capture :data
  var user = {name: \"Bob\"}
  @data.name = user.name
endcapture
@data.result = u";
    assert_eq!(run_script_json(script), serde_json::json!({"result": {"name": "Bob"}}));
}

#[test]
fn capture_without_focus_yields_text() {
    let script = "\
:data
var t = capture
print \"hi\"
endcapture
@data.msg = t";
    assert_eq!(run_script_json(script), serde_json::json!({"msg": "hi"}));
}

// === Test: root assignment and deep-path laws ===

#[test]
fn root_set_produces_exactly_the_value() {
    let script = ":data\n@data = payload";
    let env = Environment::new();
    let payload = Value::from_json(serde_json::json!({"a": [1, 2], "b": "x"}));
    let out = env
        .render_script_string(script, vec![("payload".to_owned(), payload)], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.to_json(), serde_json::json!({"a": [1, 2], "b": "x"}));
}

#[test]
fn deep_push_autovivifies_the_spine() {
    let script = ":data\n@data.a.b.c.d.push(5)";
    assert_eq!(run_script_json(script), serde_json::json!({"a": {"b": {"c": {"d": [5]}}}}));
}

#[test]
fn last_marker_on_empty_root_raises() {
    let env = Environment::new();
    let err = env
        .render_script_string(":data\n@data.xs.push(1)\n@data.xs.pop()\n@data.xs[] = 9", vec![], &mut NoCallsHost)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("empty array"), "{}", err.message);
}

#[test]
fn last_marker_targets_the_last_element() {
    let script = ":data\n@data.xs.push(1)\n@data.xs.push(2)\n@data.xs[] += 10";
    assert_eq!(run_script_json(script), serde_json::json!({"xs": [1, 12]}));
}

// === Test: operator shorthand ===

#[test]
fn operator_forms_map_to_methods() {
    let script = "\
:data
@data.n = 10
@data.n += 5
@data.n -= 3
@data.n *= 4
@data.n /= 2
@data.n++
@data.n--
@data.flag = false
@data.flag ||= true
@data.flag &&= \"yes\"
@data.bits = 6
@data.bits &= 3
@data.bits |= 8";
    assert_eq!(
        run_script_json(script),
        serde_json::json!({"n": 24, "flag": "yes", "bits": 10})
    );
}

// === Test: commands apply in lexical order regardless of argument latency ===

#[test]
fn command_order_is_lexical_not_completion_order() {
    // the first push's argument is fetched (slow path through the host);
    // the second is a literal, yet the log keeps source order
    let script = ":data\n@data.log.push(fetchData(\"config\"))\n@data.log.push(\"second\")";
    let out = run_script_json(script);
    let log = &out["log"];
    assert_eq!(log[0]["theme"], "dark");
    assert_eq!(log[1], "second");
}

// === Test: focus projection shapes ===

#[test]
fn text_focus_returns_a_plain_string() {
    let env = Environment::new();
    let out = env.render_script_string(":text\nprint \"a\"\nprint \"b\"", vec![], &mut NoCallsHost).unwrap();
    assert_eq!(out, Output::Text("ab".to_owned()));
}

#[test]
fn no_handlers_beyond_text_yields_text_output() {
    let env = Environment::new();
    let out = env.render_script_string("print 1 + 1", vec![], &mut NoCallsHost).unwrap();
    assert_eq!(out, Output::Text("2".to_owned()));
}

#[test]
fn mixed_output_yields_a_container() {
    let env = Environment::new();
    let out = env
        .render_script_string("print \"hello\"\n@data.x = 1", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.text(), Some("hello"));
    assert_eq!(out.data().map(Value::to_json), Some(serde_json::json!({"x": 1})));
}

#[test]
fn script_mode_drops_plain_dicts_from_text() {
    let env = Environment::new();
    let out = env
        .render_script_string(
            "print obj\nprint \"|\"\nprint arr",
            vec![
                ("obj".to_owned(), Value::from_json(serde_json::json!({"a": 1}))),
                ("arr".to_owned(), Value::from_json(serde_json::json!([1, 2]))),
            ],
            &mut NoCallsHost,
        )
        .unwrap();
    assert_eq!(out.text(), Some("|1,2"));
}

// === Test: user handlers and custom data methods ===

struct Collector {
    lines: Vec<String>,
}

impl millrace::CommandHandler for Collector {
    fn command(&mut self, method: &str, path: &[Value], args: &[Value]) -> Result<(), millrace::Exception> {
        let path: Vec<String> = path.iter().map(Value::coerce_str).collect();
        let args: Vec<String> = args.iter().map(Value::coerce_str).collect();
        self.lines.push(format!("{method}({}) at [{}]", args.join(","), path.join(".")));
        Ok(())
    }

    fn return_value(&self) -> Option<Value> {
        Some(Value::array(self.lines.iter().map(Value::str).collect()))
    }
}

#[test]
fn class_handlers_receive_commands_and_contribute_artifacts() {
    let mut env = Environment::new();
    env.add_command_handler_class("audit", || Box::new(Collector { lines: Vec::new() }));
    let out = env
        .render_script_string(":audit\n@audit.user.update(\"bob\")\n@audit.log(\"done\")", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(
        out.to_json(),
        serde_json::json!(["update(bob) at [user]", "log(done) at []"])
    );
}

#[test]
fn callable_handlers_collect_results() {
    let mut env = Environment::new();
    env.add_command_handler_fn("shout", |args| Ok(Value::from(args[0].coerce_str().to_uppercase())));
    let out = env
        .render_script_string(":shout\n@shout(\"one\")\n@shout(\"two\")", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.to_json(), serde_json::json!(["ONE", "TWO"]));
}

#[test]
fn custom_data_methods_extend_the_vocabulary() {
    let mut env = Environment::new();
    env.add_data_method("double", |value, _args| match value {
        Value::Int(i) => Ok(Value::Int(i * 2)),
        other => Err(millrace::Exception::runtime(format!("cannot double {}", other.type_name()))),
    });
    let out = env
        .render_script_string(":data\n@data.n = 21\n@data.n.double()", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.to_json(), serde_json::json!({"n": 42}));
}

// === Test: async filters dispatch through the host ===

#[test]
fn async_filters_pause_to_the_host() {
    let mut env = Environment::new();
    env.add_filter_async("translate");
    let mut host = FnHost::new(|call: &millrace::HostCall<'_>| {
        let path: Vec<&str> = call.path().iter().map(String::as_str).collect();
        assert_eq!(path, ["filters", "translate"]);
        Ok(Value::from(format!("<{}>", call.args()[0].coerce_str())))
    });
    let out = env.render_template_string("{{ word | translate }}", vec![("word".to_owned(), Value::str("hi"))], &mut host).unwrap();
    assert_eq!(out.text(), Some("<hi>"));
}
