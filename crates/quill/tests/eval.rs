mod common;

use common::{check, render_error, User};
use quill::{Value, VarMap};
use std::collections::BTreeMap;

fn no_vars() -> VarMap {
    VarMap::new()
}

#[test]
fn text_and_comments() {
    check(&no_vars(), Value::Invalid, "textNode", "hello {*Buddy*} World", "hello  World");
}

#[test]
fn action_literals() {
    check(&no_vars(), Value::Invalid, "action", r#"hello {{"world"}}"#, "hello world");
    check(&no_vars(), Value::Invalid, "action_int", "{{ 42 }}", "42");
    check(&no_vars(), Value::Invalid, "action_float", "{{ 1.5 }}", "1.5");
    check(&no_vars(), Value::Invalid, "action_bool", "{{ true }}", "true");
    check(&no_vars(), Value::Invalid, "action_nil", "{{ nil }}", "");
    check(&no_vars(), Value::Invalid, "action_char", "{{ 'a' }}", "97");
}

#[test]
fn default_library_pipelines() {
    check(&no_vars(), Value::Invalid, "fn", r#"hello {{lower: "WORLD"}}"#, "hello world");
    check(
        &no_vars(),
        Value::Invalid,
        "fn_pipe",
        r#"hello {{lower: "WORLD" |upper}}"#,
        "hello WORLD",
    );
    check(
        &no_vars(),
        Value::Invalid,
        "fn_pipe_arg",
        r#"hello {{lower: "WORLD-" |upper|repeat: 2}}"#,
        "hello WORLD-WORLD-",
    );
}

#[test]
fn record_fields_and_methods() {
    let mut vars = VarMap::new();
    vars.set("user", Value::object(User::new("José Santos", "email@example.com")));
    check(&vars, Value::Invalid, "field", "Oi {{ user.Name }}", "Oi José Santos");
    check(
        &vars,
        Value::Invalid,
        "field2",
        "Oi {{ user.Name }}<{{ user.Email }}>",
        "Oi José Santos<email@example.com>",
    );
    check(
        &vars,
        Value::Invalid,
        "method",
        r#"Oi {{ user.Format: "%s<%s>" }}"#,
        "Oi José Santos<email@example.com>",
    );
    check(&vars, Value::Invalid, "method2", "{{ user.GetName() }}", "José Santos");
}

#[test]
fn missing_record_field_is_an_error() {
    let mut vars = VarMap::new();
    vars.set("user", Value::object(User::new("a", "b")));
    let err = render_error(&vars, Value::Invalid, "missing_field", "{{ user.Nope }}");
    assert!(err.contains("no field or method"), "{err}");
}

#[test]
fn arithmetic() {
    check(&no_vars(), Value::Invalid, "add", "{{ 2+1 }}", "3");
    check(&no_vars(), Value::Invalid, "add3", "{{ 2+1+4 }}", "7");
    check(&no_vars(), Value::Invalid, "add_minus", "{{ 2+1+4-3 }}", "4");
    check(&no_vars(), Value::Invalid, "mult", "{{ 4*4 }}", "16");
    check(&no_vars(), Value::Invalid, "mult_add", "{{ 2+4*4 }}", "18");
    check(&no_vars(), Value::Invalid, "mult_add2", "{{ 4*2+4 }}", "12");
    check(&no_vars(), Value::Invalid, "mult_float", "{{ 1.23*1 }}", "1.23");
    check(&no_vars(), Value::Invalid, "mod", "{{ 3%2 }}", "1");
    check(&no_vars(), Value::Invalid, "mult_mod", "{{ (1*3)%2 }}", "1");
    check(&no_vars(), Value::Invalid, "div_mod", "{{ (2*5)/ 3 %1 }}", "0");
    check(&no_vars(), Value::Invalid, "neg", "{{ -5 }}", "-5");
    check(&no_vars(), Value::Invalid, "neg_add", "{{ 1 + -5 }}", "-4");
}

#[test]
fn string_concatenation_formats_the_other_side() {
    check(&no_vars(), Value::Invalid, "int_str", r#"{{ 2+"1" }}"#, "21");
    check(&no_vars(), Value::Invalid, "str_int", r#"{{ "1"+2 }}"#, "12");
    check(&no_vars(), Value::Invalid, "str_str", r#"{{ "a"+"b" }}"#, "ab");
}

#[test]
fn string_subtraction_fails() {
    let err = render_error(&no_vars(), Value::Invalid, "str_sub", r#"{{ "a"-"b" }}"#);
    assert!(err.contains("subtraction"), "{err}");
}

#[test]
fn non_numeric_arithmetic_fails() {
    let err = render_error(&no_vars(), Value::Invalid, "bool_mul", "{{ true * 2 }}");
    assert!(err.contains("non numeric"), "{err}");
}

#[test]
fn comparisons() {
    check(&no_vars(), Value::Invalid, "eq", "{{ (2*5)==10 }}", "true");
    check(&no_vars(), Value::Invalid, "eq2", "{{ (2*5)==5 }}", "false");
    check(&no_vars(), Value::Invalid, "or", "{{ (2*5)==5 || true }}", "true");
    check(&no_vars(), Value::Invalid, "or2", "{{ (2*5)==5 || false }}", "false");
    check(&no_vars(), Value::Invalid, "gt", "{{ 5*5 > 2*12.5 }}", "false");
    check(&no_vars(), Value::Invalid, "ge", "{{ 5*5 >= 2*12.5 }}", "true");
    check(&no_vars(), Value::Invalid, "uint_int", "{{ 0x10 == 16 }}", "true");
    check(&no_vars(), Value::Invalid, "str_lt", r#"{{ "a" < "b" }}"#, "true");
}

#[test]
fn short_circuit_skips_the_right_side() {
    // the right side would fail to resolve if evaluated
    check(&no_vars(), Value::Invalid, "and_sc", "{{ false && missing }}", "false");
    check(&no_vars(), Value::Invalid, "or_sc", "{{ true || missing }}", "true");
}

#[test]
fn ternary_evaluates_only_the_selected_side() {
    check(&no_vars(), Value::Invalid, "ternary", r#"{{ 1 ? "a" : "b" }}"#, "a");
    check(&no_vars(), Value::Invalid, "ternary2", r#"{{ 0 ? missing : "b" }}"#, "b");
}

#[test]
fn truthiness_of_zero_values() {
    check(&no_vars(), Value::Invalid, "if0", "{{ if 0 }}x{{ else }}y{{ end }}", "y");
    check(&no_vars(), Value::Invalid, "if1", "{{ if 1 }}x{{ else }}y{{ end }}", "x");
    check(&no_vars(), Value::Invalid, "if_str", r#"{{ if "" }}x{{ else }}y{{ end }}"#, "y");
    // not the zero of its kind, so truthy
    check(&no_vars(), Value::Invalid, "if_neg", "{{ if -1 }}x{{ else }}y{{ end }}", "x");
}

#[test]
fn scope_chain_shadowing() {
    check(
        &no_vars(),
        Value::Invalid,
        "scope",
        "{{ let x := 1 }}{{ if true }}{{ let x := 2 }}{{ x }}{{ end }} {{ x }}",
        "2 1",
    );
}

#[test]
fn let_keyword_is_optional_for_declarations() {
    check(&no_vars(), Value::Invalid, "decl", "{{ x := 1 }}{{ x }}", "1");
    check(&no_vars(), Value::Invalid, "let_decl", "{{ let x := 1 }}{{ x }}", "1");
}

#[test]
fn assignment_updates_the_defining_frame() {
    check(
        &no_vars(),
        Value::Invalid,
        "assign_outer",
        "{{ x := 1 }}{{ if true }}{{ x = 2 }}{{ end }}{{ x }}",
        "2",
    );
}

#[test]
fn assignment_to_an_unknown_name_is_a_silent_noop() {
    check(&no_vars(), Value::Invalid, "assign_noop", "{{ ghost = 2 }}ok", "ok");
}

#[test]
fn if_with_init_binding() {
    check(
        &no_vars(),
        Value::Invalid,
        "if_init",
        "{{ if v := 5; v > 2 }}{{ v }}{{ end }}",
        "5",
    );
}

#[test]
fn discard_target() {
    check(&no_vars(), Value::Invalid, "discard", "{{ _ := 1 }}ok", "ok");
    let err = render_error(&no_vars(), Value::Invalid, "discard_read", "{{ _ := 1 }}{{ _ }}");
    assert!(err.contains("_"), "{err}");
}

#[test]
fn isset_probes() {
    let mut entries = BTreeMap::new();
    entries.insert("a".to_string(), Value::Int(1));
    let mut vars = VarMap::new();
    vars.set("m", Value::map(entries));
    check(
        &vars,
        Value::Invalid,
        "isset",
        "{{ isset(m.a) }}/{{ isset(m.b) }}/{{ isset(n) }}",
        "true/false/false",
    );
    check(&vars, Value::Invalid, "isset_index", r#"{{ isset(m["a"]) }}/{{ isset(m["z"]) }}"#, "true/false");
    check(&vars, Value::Invalid, "isset_nil_mid", "{{ isset(m.b.c.d) }}", "false");
    check(&no_vars(), Value::Invalid, "isset_ctx", "{{ isset(.) }}", "false");
}

#[test]
fn missing_map_key_renders_nothing() {
    let mut vars = VarMap::new();
    vars.set("m", Value::map(BTreeMap::new()));
    check(&vars, Value::Invalid, "missing_key", "[{{ m.gone }}]", "[]");
}

#[test]
fn unknown_identifier_is_an_error() {
    let err = render_error(&no_vars(), Value::Invalid, "unknown", "{{ missing }}");
    assert!(err.contains("is not available in the current scope"), "{err}");
    assert!(err.starts_with("Jet Runtime Error (unknown:1):"), "{err}");
}

#[test]
fn pipeline_default() {
    check(&no_vars(), Value::Invalid, "default1", r#"{{ missing | default: "d" }}"#, "d");
    let mut vars = VarMap::new();
    vars.set("x", "v");
    check(&vars, Value::Invalid, "default2", r#"{{ x | default: "d" }}"#, "v");
}

#[test]
fn pipeline_placeholder_pins_the_piped_value() {
    check(
        &no_vars(),
        Value::Invalid,
        "placeholder",
        r#"{{ 2 | repeat("foo", _) }}"#,
        "foofoo",
    );
}

#[test]
fn index_and_slice() {
    let mut vars = VarMap::new();
    vars.set(
        "list",
        Value::list(vec![Value::from("a"), Value::from("b"), Value::from("c")]),
    );
    vars.set("s", "abc");
    check(&vars, Value::Invalid, "index", "{{ list[1] }}", "b");
    check(&vars, Value::Invalid, "index_str", "{{ s[0] }}", "a");
    check(&vars, Value::Invalid, "slice", "{{ list[1:3] }}", "[b, c]");
    check(&vars, Value::Invalid, "slice_open", "{{ list[:2] }}", "[a, b]");
    check(&vars, Value::Invalid, "slice_str", "{{ s[1:] }}", "bc");
}

#[test]
fn index_out_of_range_is_an_error() {
    let mut vars = VarMap::new();
    vars.set("list", Value::list(vec![Value::Int(1)]));
    let err = render_error(&vars, Value::Invalid, "oob", "{{ list[5] }}");
    assert!(err.contains("out of range"), "{err}");
    let err = render_error(&vars, Value::Invalid, "neg_index", "{{ list[-1] }}");
    assert!(err.contains("out of range"), "{err}");
}

#[test]
fn index_lookup_assignment() {
    let mut entries = BTreeMap::new();
    entries.insert("a".to_string(), Value::Int(1));
    let mut vars = VarMap::new();
    vars.set("m", Value::map(entries));
    check(&vars, Value::Invalid, "lookup_hit", r#"{{ v, ok := m["a"]; ok }}:{{ v }}"#, "true:1");
    check(&vars, Value::Invalid, "lookup_miss", r#"{{ v, ok := m["z"]; ok }}"#, "false");
}

#[test]
fn try_catch_captures_template_errors() {
    check(
        &no_vars(),
        Value::Invalid,
        "try",
        "{{ try }}a{{ missing }}b{{ catch err }}E({{ err }}){{ end }}",
        "aE(identifier \"missing\" is not available in the current scope)",
    );
    check(&no_vars(), Value::Invalid, "try_silent", "{{ try }}{{ missing }}{{ end }}ok", "ok");
    check(&no_vars(), Value::Invalid, "try_clean", "{{ try }}fine{{ catch e }}bad{{ end }}", "fine");
}

#[test]
fn return_unwinds_the_template() {
    check(&no_vars(), Value::Invalid, "return", "a{{ return 1 }}b", "a");
    check(
        &no_vars(),
        Value::Invalid,
        "return_nested",
        "{{ if true }}a{{ return 1 }}{{ end }}b",
        "a",
    );
}

#[test]
fn builtins() {
    check(&no_vars(), Value::Invalid, "len_str", r#"{{ len("héllo") }}"#, "5");
    check(&no_vars(), Value::Invalid, "len_list", "{{ len(slice(1, 2, 3)) }}", "3");
    check(&no_vars(), Value::Invalid, "split", r#"{{ split("a,b", ",") }}"#, "[a, b]");
    check(&no_vars(), Value::Invalid, "trim", r#"{{ trimSpace("  x ") }}"#, "x");
    check(&no_vars(), Value::Invalid, "prefix", r#"{{ hasPrefix("quill", "qu") }}"#, "true");
    check(&no_vars(), Value::Invalid, "map_builder", r#"{{ map("a", 1).a }}"#, "1");
    check(&no_vars(), Value::Invalid, "replace", r#"{{ replace("aaa", "a", "b", 2) }}"#, "bba");
    check(&no_vars(), Value::Invalid, "json", r#"{{ json(slice(1, 2)) }}"#, "[1,2]");
    check(&no_vars(), Value::Invalid, "html_fn", r#"{{ html("<b>") }}"#, "&lt;b&gt;");
    check(&no_vars(), Value::Invalid, "url_fn", r#"{{ url("a b&c") }}"#, "a+b%26c");
}
