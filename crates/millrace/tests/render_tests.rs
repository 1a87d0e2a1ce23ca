//! End-to-end template rendering: control flow, assignment visibility,
//! macros, inheritance, imports.

use millrace::{Environment, ErrorKind, FnHost, MemoryLoader, NoCallsHost, Output, Value};

/// Renders with a host that answers `f(x)` as `"f:" + x` and rejects
/// everything else.
fn render(src: &str, ctx: Vec<(String, Value)>) -> Output {
    let env = Environment::new();
    let mut host = FnHost::new(|call: &millrace::HostCall<'_>| {
        let path: Vec<&str> = call.path().iter().map(String::as_str).collect();
        match path.as_slice() {
            ["f"] => Ok(Value::from(format!("f:{}", call.args()[0].coerce_str()))),
            other => Err(millrace::Exception::runtime(format!("no host function {}", other.join(".")))),
        }
    });
    env.render_template_string(src, ctx, &mut host).unwrap()
}

fn render_text(src: &str, ctx: Vec<(String, Value)>) -> String {
    match render(src, ctx) {
        Output::Text(text) => text,
        other => panic!("expected text output, got {other:?}"),
    }
}

fn ctx1(name: &str, value: Value) -> Vec<(String, Value)> {
    vec![(name.to_owned(), value)]
}

// === Test: literals, expressions, filters ===

#[test]
fn renders_literal_text_and_expressions() {
    assert_eq!(render_text("Hello {{ 1 + 2 }}!", vec![]), "Hello 3!");
    assert_eq!(render_text("{{ 'a' ~ 'b' ~ 3 }}", vec![]), "ab3");
    assert_eq!(render_text("{{ 10 // 3 }} {{ 10 % 3 }} {{ 2 ** 5 }}", vec![]), "3 1 32");
    assert_eq!(render_text("{{ [1, 2, 3] }}", vec![]), "1,2,3");
}

#[test]
fn renders_filters_and_tests() {
    assert_eq!(render_text("{{ name | upper }}", ctx1("name", Value::str("bob"))), "BOB");
    assert_eq!(render_text("{{ xs | join('-') }}", ctx1("xs", Value::array(vec![Value::Int(1), Value::Int(2)]))), "1-2");
    assert_eq!(render_text("{{ missing | default('d') }}", vec![]), "d");
    assert_eq!(render_text("{% if 4 is even %}even{% endif %}", vec![]), "even");
    assert_eq!(render_text("{% if x is not defined %}nope{% endif %}", vec![]), "nope");
}

#[test]
fn undefined_renders_empty_unless_strict() {
    assert_eq!(render_text("[{{ missing }}]", vec![]), "[]");

    let mut env = Environment::new();
    env.set_throw_on_undefined(true);
    let err = env
        .render_template_string("{{ missing }}", vec![], &mut NoCallsHost)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Template);
    assert!(err.message.contains("missing"), "{}", err.message);
}

// === Test: control flow ===

#[test]
fn if_elif_else() {
    let src = "{% if n > 10 %}big{% elif n > 5 %}mid{% else %}small{% endif %}";
    assert_eq!(render_text(src, ctx1("n", Value::Int(20))), "big");
    assert_eq!(render_text(src, ctx1("n", Value::Int(7))), "mid");
    assert_eq!(render_text(src, ctx1("n", Value::Int(1))), "small");
}

#[test]
fn for_over_arrays_and_dicts() {
    let src = "{% for x in xs %}{{ x }};{% endfor %}";
    let xs = Value::array(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
    assert_eq!(render_text(src, ctx1("xs", xs)), "3;1;2;");

    // dictionary iteration follows insertion order
    let json: serde_json::Value = serde_json::from_str(r#"{"z": 1, "a": 2, "m": 3}"#).unwrap();
    let src = "{% for k, v in d %}{{ k }}={{ v }};{% endfor %}";
    assert_eq!(render_text(src, ctx1("d", Value::from_json(json))), "z=1;a=2;m=3;");
}

#[test]
fn for_else_and_loop_variables() {
    assert_eq!(render_text("{% for x in xs %}x{% else %}empty{% endfor %}", ctx1("xs", Value::array(vec![]))), "empty");

    let src = "{% for x in xs %}{{ loop.index }}/{{ loop.length }}{% if not loop.last %},{% endif %}{% endfor %}";
    let xs = Value::array(vec![Value::str("a"), Value::str("b"), Value::str("c")]);
    assert_eq!(render_text(src, ctx1("xs", xs)), "1/3,2/3,3/3");
}

#[test]
fn while_runs_iterations_sequentially() {
    let src = "{% var n = 0 %}{% while n < 3 %}{{ n }}{% set n = n + 1 %}{% endwhile %}end:{{ n }}";
    assert_eq!(render_text(src, vec![]), "012end:3");
}

#[test]
fn switch_matches_cases_and_default() {
    let src = "{% switch x %}{% case 1, 2 %}low{% case 3 %}three{% default %}other{% endswitch %}";
    assert_eq!(render_text(src, ctx1("x", Value::Int(2))), "low");
    assert_eq!(render_text(src, ctx1("x", Value::Int(3))), "three");
    assert_eq!(render_text(src, ctx1("x", Value::Int(9))), "other");
}

// === Test: assignment visibility ===

#[test]
fn later_reads_observe_earlier_writes() {
    let src = "{% set x = f('a') %}{{ x }}{% set x = 'b' %}{{ x }}";
    assert_eq!(render_text(src, vec![]), "f:ab");
}

#[test]
fn reads_before_a_write_see_the_old_binding() {
    let src = "{{ x }}{% set x = 'new' %}{{ x }}";
    assert_eq!(render_text(src, ctx1("x", Value::str("old"))), "oldnew");
}

#[test]
fn writes_inside_branches_escape_to_the_frame() {
    let src = "{% if yes %}{% set x = 'in' %}{% endif %}{{ x }}";
    assert_eq!(render_text(src, ctx1("yes", Value::Bool(true))), "in");
    assert_eq!(render_text(src, ctx1("yes", Value::Bool(false))), "");
}

#[test]
fn loop_writes_thread_through_iterations() {
    let src = "{% var total = 0 %}{% for x in xs %}{% set total = total + x %}{% endfor %}{{ total }}";
    let xs = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert_eq!(render_text(src, ctx1("xs", xs)), "6");
}

#[test]
fn multi_target_assignment_unpacks() {
    assert_eq!(render_text("{% set a, b = pair %}{{ a }}{{ b }}", ctx1("pair", Value::array(vec![Value::Int(1), Value::Int(2)]))), "12");
}

// === Test: macros and callers ===

#[test]
fn macros_render_with_parameters_and_defaults() {
    let src = "{% macro greet(name, punct='!') %}Hi {{ name }}{{ punct }}{% endmacro %}{{ greet('Bob') }}{{ greet('Ann', '?') }}";
    assert_eq!(render_text(src, vec![]), "Hi Bob!Hi Ann?");
}

#[test]
fn call_blocks_bind_caller() {
    let src = "{% macro wrap() %}[{{ caller() }}]{% endmacro %}{% call wrap() %}body{% endcall %}";
    assert_eq!(render_text(src, vec![]), "[body]");
}

#[test]
fn macros_close_over_their_definition_frame() {
    let src = "{% var tag = 'em' %}{% macro m() %}<{{ tag }}>{% endmacro %}{% var tag2 = 'x' %}{{ m() }}";
    assert_eq!(render_text(src, vec![]), "<em>");
}

#[test]
fn filter_blocks_pipe_their_body() {
    let src = "{% filter upper %}shout {{ 'it' }}{% endfilter %}";
    assert_eq!(render_text(src, vec![]), "SHOUT IT");
}

// === Test: inheritance and includes ===

fn env_with_templates(pairs: &[(&str, &str)]) -> Environment {
    let mut loader = MemoryLoader::new();
    for (name, source) in pairs {
        loader.add(*name, *source);
    }
    let mut env = Environment::new();
    env.set_loader(loader);
    env
}

#[test]
fn include_renders_with_current_context() {
    let env = env_with_templates(&[("part.njk", "Hello {{ who }}")]);
    let out = env
        .render_template_string("[{% include 'part.njk' %}]", ctx1("who", Value::str("you")), &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.text(), Some("[Hello you]"));
}

#[test]
fn include_ignore_missing_swallows_not_found() {
    let env = env_with_templates(&[]);
    let out = env
        .render_template_string("a{% include 'nope.njk' ignore missing %}b", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.text(), Some("ab"));

    let err = env
        .render_template_string("{% include 'nope.njk' %}", vec![], &mut NoCallsHost)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Template);
}

#[test]
fn extends_overrides_blocks() {
    let env = env_with_templates(&[("parent.njk", "PARENT[{% block c %}default{% endblock %}]")]);
    let out = env
        .render_template_string("{% extends 'parent.njk' %}{% block c %}child{% endblock %}", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.text(), Some("PARENT[child]"));
}

#[test]
fn conditional_extends_buffers_blocks() {
    let env = env_with_templates(&[("parent.njk", "PARENT[{% block c %}default{% endblock %}]")]);
    let child = "{% if use %}{% extends 'parent.njk' %}{% endif %}{% block c %}child{% endblock %}";

    let out = env.render_template_string(child, ctx1("use", Value::Bool(true)), &mut NoCallsHost).unwrap();
    assert_eq!(out.text(), Some("PARENT[child]"));

    let out = env.render_template_string(child, ctx1("use", Value::Bool(false)), &mut NoCallsHost).unwrap();
    assert_eq!(out.text(), Some("child"));
}

#[test]
fn super_reaches_the_parent_block() {
    let env = env_with_templates(&[("parent.njk", "{% block c %}base{% endblock %}")]);
    let out = env
        .render_template_string(
            "{% extends 'parent.njk' %}{% block c %}({{ super() }})+child{% endblock %}",
            vec![],
            &mut NoCallsHost,
        )
        .unwrap();
    assert_eq!(out.text(), Some("(base)+child"));
}

#[test]
fn import_exposes_macros() {
    let env = env_with_templates(&[("lib.njk", "{% macro hi(n) %}HI {{ n }}{% endmacro %}")]);
    let out = env
        .render_template_string("{% import 'lib.njk' as lib %}{{ lib.hi('a') }}", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.text(), Some("HI a"));

    let out = env
        .render_template_string("{% from 'lib.njk' import hi as greet %}{{ greet('b') }}", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.text(), Some("HI b"));
}

// === Test: extensions ===

#[test]
fn extensions_add_custom_tags() {
    struct Shout;

    impl millrace::Extension for Shout {
        fn tag(&self) -> &str {
            "shout"
        }

        fn has_body(&self) -> bool {
            true
        }

        fn run(&self, _args: &[Value], body: Option<&str>) -> Result<Value, millrace::Exception> {
            Ok(Value::from(body.unwrap_or_default().to_uppercase()))
        }
    }

    let mut env = Environment::new();
    env.add_extension(Shout).unwrap();
    let out = env
        .render_template_string("{% shout %}quiet {{ 'word' }}{% endshout %}", vec![], &mut NoCallsHost)
        .unwrap();
    assert_eq!(out.text(), Some("QUIET WORD"));
}

#[test]
fn extensions_may_not_shadow_reserved_tags() {
    struct Bad;

    impl millrace::Extension for Bad {
        fn tag(&self) -> &str {
            "if"
        }

        fn run(&self, _args: &[Value], _body: Option<&str>) -> Result<Value, millrace::Exception> {
            Ok(Value::Undefined)
        }
    }

    let err = Environment::new().add_extension(Bad).map(|_| ()).unwrap_err();
    assert!(err.message.contains("reserved"), "{}", err.message);
}

// === Test: error surfacing ===

#[test]
fn runtime_errors_surface_template_and_line() {
    let env = env_with_templates(&[]);
    let template = env.compile_template("line one\n{{ 1 / 0 }}", Some("page.njk")).unwrap();
    // no external calls are involved, so the failure rejects from start()
    let err = template.start(vec![], millrace::RenderOptions::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("division by zero"), "{}", err.message);
    assert_eq!(err.template.as_deref(), Some("page.njk"));
    assert_eq!(err.loc.map(|l| l.line), Some(2));
    assert!(err.to_string().contains("(page.njk)"), "{err}");
}

#[test]
fn raised_host_errors_become_runtime_poison() {
    let env = Environment::new();
    let mut host = FnHost::new(|_call: &millrace::HostCall<'_>| {
        Err::<Value, _>(millrace::Exception::runtime("backend down"))
    });
    let err = env.render_template_string("{{ fetch() }}", vec![], &mut host).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("backend down"), "{}", err.message);
}
