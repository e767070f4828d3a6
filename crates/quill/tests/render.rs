mod common;

use common::{check, run_with_set, User};
use quill::{Arguments, InMemLoader, Set, Value, VarMap};
use std::collections::BTreeMap;
use std::sync::Arc;

fn record(pairs: &[(&str, Value)]) -> Value {
    let mut entries = BTreeMap::new();
    for (key, value) in pairs {
        entries.insert(key.to_string(), value.clone());
    }
    Value::map(entries)
}

#[test]
fn scenario_hello_world() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "s1",
        r#"hello {{ "world" }}"#,
        "hello world",
    );
}

#[test]
fn scenario_host_functions_pipeline() {
    let mut vars = VarMap::new();
    vars.set_native("upper", |_, args: Arguments| {
        Ok(Value::from(args.string("upper", 0)?.to_uppercase()))
    });
    vars.set_native("lower", |_, args: Arguments| {
        Ok(Value::from(args.string("lower", 0)?.to_lowercase()))
    });
    vars.set_native("repeat", |_, args: Arguments| {
        // piped form receives the count first and the string last
        let (count, s) = match (args.get(0), args.get(1)) {
            (Value::String(s), n) => (quill::value::to_int(&n).unwrap_or(0), s),
            (n, Value::String(s)) => (quill::value::to_int(&n).unwrap_or(0), s),
            _ => return Err(quill::diagnostics::simple_error("repeat: bad arguments")),
        };
        Ok(Value::from(s.repeat(count.max(0) as usize)))
    });
    check(
        &vars,
        Value::Invalid,
        "s2",
        r#"{{ lower: "WORLD-" | upper | repeat: 2 }}"#,
        "WORLD-WORLD-",
    );
}

#[test]
fn scenario_context_condition() {
    let context = record(&[("Name", Value::from("J")), ("Email", Value::from("e@x"))]);
    check(
        &VarMap::new(),
        context,
        "s3",
        r#"{{ if .Email == "e@x" }}y{{ else }}n{{ end }}"#,
        "y",
    );
}

#[test]
fn scenario_range_key_value() {
    let context = Value::list(vec![
        record(&[("N", Value::from("a"))]),
        record(&[("N", Value::from("b"))]),
    ]);
    check(
        &VarMap::new(),
        context,
        "s4",
        "{{ range i, u := . }}{{ i }}:{{ u.N }};{{ end }}",
        "0:a;1:b;",
    );
}

#[test]
fn scenario_block_define_and_yield() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "s5",
        r#"{{ block hello() "Buddy" }}Hello {{ . }}{{ end }},{{ yield hello() "Joe" }}"#,
        "Hello Buddy,Hello Joe",
    );
}

#[test]
fn scenario_block_override_via_extends() {
    let loader = InMemLoader::new();
    loader.add(
        "parent",
        r#"{{ block hello() "Buddy" }}Hello {{ . }}{{ end }},{{ yield hello() "Joe" }}"#,
    );
    loader.add(
        "child",
        r#"{{extends "parent"}}{{ block hello() "Buddy" }}Hey {{ . }}{{ end }}"#,
    );
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "child", "");
    assert_eq!(out, "Hey Buddy,Hey Joe");
}

#[test]
fn scenario_isset() {
    let mut vars = VarMap::new();
    vars.set("m", record(&[("a", Value::Int(1))]));
    check(
        &vars,
        Value::Invalid,
        "s7",
        "{{ isset(m.a) }}/{{ isset(m.b) }}/{{ isset(n) }}",
        "true/false/false",
    );
}

#[test]
fn block_parameters_and_defaults() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "params",
        r#"{{ block greet(name, punct="!") }}Hi {{ name }}{{ punct }}{{ end }}|{{ yield greet(name="Joe") }}|{{ yield greet("Ada", "?") }}"#,
        "Hi false!|Hi Joe!|Hi Ada?",
    );
}

#[test]
fn yield_content_runs_in_the_callers_scope() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "content_scope",
        r#"{{ block wrap() }}[{{ yield content }}]{{ end }}{{ x := "outer" }}{{ yield wrap() content }}{{ x }}{{ end }}"#,
        "[][outer]",
    );
}

#[test]
fn yield_content_with_marker_body() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "content_marker",
        "{{ block box() }}<{{ yield content }}>{{ content }}default{{ end }}|{{ yield box() content }}custom{{ end }}",
        "<default>|<custom>",
    );
}

#[test]
fn nested_yield_content() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "nested_content",
        "{{ block a() }}A({{ yield content }}){{ end }}{{ block b() }}B({{ yield content }}){{ end }}{{ yield a() content }}{{ yield b() content }}x{{ end }}{{ end }}",
        "A()B()A(B(x))",
    );
}

#[test]
fn include_with_context() {
    let loader = InMemLoader::new();
    loader.add("partial", "Hello {{ . }}");
    loader.add("main", r#"<{{ include "partial" "World" }}>"#);
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::from("ctx"), "main", "");
    assert_eq!(out, "<Hello World>");
}

#[test]
fn include_restores_the_callers_context() {
    let loader = InMemLoader::new();
    loader.add("partial", "{{ . }}");
    loader.add("main", r#"{{ include "partial" "inner" }}|{{ . }}"#);
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::from("outer"), "main", "");
    assert_eq!(out, "inner|outer");
}

#[test]
fn include_name_from_expression() {
    let loader = InMemLoader::new();
    loader.add("partial", "P");
    loader.add("main", r#"{{ include "part" + "ial" }}"#);
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "main", "");
    assert_eq!(out, "P");
}

#[test]
fn imported_blocks_are_yieldable() {
    let loader = InMemLoader::new();
    loader.add("lib", "{{ block badge(kind) }}<{{ kind }}>{{ end }}");
    loader.add("page", r#"{{import "lib"}}{{ yield badge(kind="new") }}"#);
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "page", "");
    assert_eq!(out, "<new>");
}

#[test]
fn extends_chain_renders_the_root() {
    let loader = InMemLoader::new();
    loader.add("base", "[{{ yield body() }}]{{ block body() }}base{{ end }}");
    loader.add("mid", r#"{{extends "base"}}{{ block body() }}mid{{ end }}"#);
    loader.add("leaf", r#"{{extends "mid"}}{{ block body() }}leaf{{ end }}"#);
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "leaf", "");
    assert_eq!(out, "[leaf]leaf");
}

#[test]
fn html_escaping_applies_to_values_not_text() {
    let loader = InMemLoader::new();
    loader.add("page", r#"<p>{{ "<b>&</b>" }}</p>"#);
    let set = Set::new_html(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "page", "");
    assert_eq!(out, "<p>&lt;b&gt;&amp;&lt;/b&gt;</p>");
}

#[test]
fn safe_writers_bypass_the_escape_step() {
    let loader = InMemLoader::new();
    loader.add("page", r#"{{ "<b>" | unsafe }}|{{ "<b>" }}"#);
    let set = Set::new_html(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "page", "");
    assert_eq!(out, "<b>|&lt;b&gt;");
}

#[test]
fn safe_js_escapes_line_separators() {
    let loader = InMemLoader::new();
    loader.add("page", "{{ \"a\u{2028}b\u{2029}c é\" | safeJs }}");
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "page", "");
    assert_eq!(out, "a\\u2028b\\u2029c é");
}

#[test]
fn safe_writer_must_terminate_its_pipeline() {
    let loader = InMemLoader::new();
    loader.add("page", r#"{{ "<b>" | unsafe | upper }}"#);
    let set = Set::new_html(loader);
    let template = set.get_template("page").expect("parses fine");
    let mut out = Vec::new();
    let err = template
        .execute(&set, &mut out, &VarMap::new(), Value::Invalid)
        .expect_err("writer stage is not last");
    assert!(err.to_string().contains("last pipeline stage"), "{err}");
}

#[test]
fn renderer_values_render_themselves() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "write_json",
        r#"{{ writeJson(map("a", 1)) }}"#,
        "{\"a\":1}\n",
    );
}

#[test]
fn trim_markers_drop_surrounding_whitespace() {
    check(&VarMap::new(), Value::Invalid, "trim", "x {{- 1 -}} y", "x1y");
    check(&VarMap::new(), Value::Invalid, "trim_left", "x {{- 2 }} y", "x2 y");
}

#[test]
fn custom_delimiters_render() {
    let loader = InMemLoader::new();
    loader.add("page", "<< \"hi\" >> {{ not an action }}");
    let mut set = Set::new(loader);
    set.set_delims("<<", ">>");
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "page", "");
    assert_eq!(out, "hi {{ not an action }}");
}

#[test]
fn exec_returns_the_template_return_value() {
    let loader = InMemLoader::new();
    loader.add("calc", "ignored {{ return 6 * 7 }}");
    loader.add("main", r#"{{ exec("calc") }}"#);
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "main", "");
    assert_eq!(out, "42");
}

#[test]
fn include_if_exists_is_silent_on_missing() {
    let loader = InMemLoader::new();
    loader.add("partial", "here");
    loader.add(
        "main",
        r#"{{ includeIfExists("partial") }}|{{ includeIfExists("ghost") }}"#,
    );
    let set = Set::new(loader);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "main", "");
    assert_eq!(out, "here|");
}

#[test]
fn translator_hook_feeds_msg() {
    struct Upcase;
    impl quill::Translator for Upcase {
        fn msg(&self, key: &str, _default_value: &str) -> String {
            key.to_uppercase()
        }
        fn trans(&self, format: &str, _default_format: &str, _args: &[Value]) -> String {
            format.to_string()
        }
    }

    let loader = InMemLoader::new();
    loader.add("page", r#"{{ msg("greeting", "hello") }}"#);
    let set = Set::new(loader);
    let template = set.get_template("page").expect("parses");

    let mut out = Vec::new();
    template
        .execute_i18n(&set, Some(&Upcase), &mut out, &VarMap::new(), Value::Invalid)
        .expect("renders");
    assert_eq!(out, b"GREETING");

    // without a translator the default text wins
    let mut out = Vec::new();
    template
        .execute(&set, &mut out, &VarMap::new(), Value::Invalid)
        .expect("renders");
    assert_eq!(out, b"hello");
}

#[test]
fn concurrent_executions_do_not_cross_talk() {
    let loader = InMemLoader::new();
    loader.add("page", "{{ range v := . }}{{ v }}{{ end }}:{{ user.Name }}");
    let set = Arc::new(Set::new(loader));
    let template = set.get_template("page").expect("parses");

    let mut handles = Vec::new();
    for i in 0..8 {
        let set = Arc::clone(&set);
        let template = Arc::clone(&template);
        handles.push(std::thread::spawn(move || {
            let mut vars = VarMap::new();
            vars.set("user", Value::object(User::new(&format!("u{i}"), "e")));
            let context = Value::list(vec![Value::Int(i), Value::Int(i + 1)]);
            let mut out = Vec::new();
            template
                .execute(&set, &mut out, &vars, context)
                .expect("render failed");
            (i, String::from_utf8(out).expect("utf-8"))
        }));
    }
    for handle in handles {
        let (i, out) = handle.join().expect("thread panicked");
        assert_eq!(out, format!("{}{}:u{}", i, i + 1, i));
    }
}

#[test]
fn abort_on_error_can_be_disabled() {
    let loader = InMemLoader::new();
    loader.add("page", "a{{ missing }}b");
    let mut set = Set::new(loader);
    set.set_abort_on_error(false);
    let out = run_with_set(&set, &VarMap::new(), Value::Invalid, "page", "");
    assert_eq!(out, "ab");
}
