mod common;

use common::{check, render_error, run};
use quill::ranger::Ranger;
use quill::{QuillResult, Record, SmolStr, Stream, Value, VarMap};
use std::collections::BTreeMap;
use std::sync::mpsc;

#[test]
fn range_over_list() {
    let context = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    check(
        &VarMap::new(),
        context.clone(),
        "list_ctx",
        "{{ range . }}{{ . }},{{ end }}",
        "1,2,3,",
    );
    check(
        &VarMap::new(),
        context,
        "list_kv",
        "{{ range i, v := . }}{{ i }}={{ v }};{{ end }}",
        "0=1;1=2;2=3;",
    );
}

#[test]
fn range_over_map_is_key_ordered() {
    let mut entries = BTreeMap::new();
    entries.insert("b".to_string(), Value::Int(2));
    entries.insert("a".to_string(), Value::Int(1));
    check(
        &VarMap::new(),
        Value::map(entries),
        "map_ctx",
        "{{ range k, v := . }}{{ k }}={{ v }};{{ end }}",
        "a=1;b=2;",
    );
}

#[test]
fn range_over_string_chars() {
    check(
        &VarMap::new(),
        Value::from("héllo"),
        "str_ctx",
        "{{ range . }}[{{ . }}]{{ end }}",
        "[h][é][l][l][o]",
    );
}

#[test]
fn range_else_runs_on_empty_producers() {
    check(
        &VarMap::new(),
        Value::list(Vec::new()),
        "empty_list",
        "{{ range . }}x{{ else }}empty{{ end }}",
        "empty",
    );
    check(
        &VarMap::new(),
        Value::list(vec![Value::Int(1)]),
        "nonempty_list",
        "{{ range . }}x{{ else }}empty{{ end }}",
        "x",
    );
}

#[test]
fn ints_ranger() {
    check(
        &VarMap::new(),
        Value::Invalid,
        "ints",
        "{{ range v := ints(0, 4) }}{{ v }}{{ end }}",
        "0123",
    );
    check(
        &VarMap::new(),
        Value::Invalid,
        "ints_kv",
        "{{ range i, v := ints(5, 8) }}{{ i }}:{{ v }};{{ end }}",
        "0:5;1:6;2:7;",
    );
    check(
        &VarMap::new(),
        Value::Invalid,
        "ints_empty",
        "{{ range v := ints(3, 3) }}{{ v }}{{ else }}none{{ end }}",
        "none",
    );
}

#[test]
fn ints_rejects_a_backwards_range() {
    let err = render_error(
        &VarMap::new(),
        Value::Invalid,
        "ints_bad",
        "{{ range v := ints(5, 1) }}{{ v }}{{ end }}",
    );
    assert!(err.contains("invalid range"), "{err}");
}

#[test]
fn channel_streams_drain_until_closed() {
    let (tx, rx) = mpsc::channel();
    for i in 0..3 {
        tx.send(Value::Int(i)).expect("receiver is alive");
    }
    drop(tx);

    let mut vars = VarMap::new();
    vars.set("events", Value::object(Stream::new(rx)));
    let out = run(
        &vars,
        Value::Invalid,
        "stream",
        "{{ range v := events }}{{ v }};{{ end }}",
    );
    assert_eq!(out, "0;1;2;");
}

#[test]
fn channel_streams_do_not_provide_an_index() {
    let (tx, rx) = mpsc::channel();
    tx.send(Value::Int(1)).expect("receiver is alive");
    drop(tx);

    let mut vars = VarMap::new();
    vars.set("events", Value::object(Stream::new(rx)));
    let err = render_error(
        &vars,
        Value::Invalid,
        "stream_kv",
        "{{ range i, v := events }}{{ v }}{{ end }}",
    );
    assert!(err.contains("does not provide an index"), "{err}");
}

/// A host type iterating through the Record ranger hook.
#[derive(Debug)]
struct Countdown(i64);

struct CountdownRanger {
    next: i64,
    i: i64,
}

impl Ranger for CountdownRanger {
    fn range(&mut self) -> QuillResult<Option<(Value, Value)>> {
        if self.next == 0 {
            return Ok(None);
        }
        let pair = (Value::Int(self.i), Value::Int(self.next));
        self.next -= 1;
        self.i += 1;
        Ok(Some(pair))
    }
}

impl Record for Countdown {
    fn type_name(&self) -> &'static str {
        "Countdown"
    }

    fn field_names(&self) -> Vec<SmolStr> {
        vec![SmolStr::new_inline("from")]
    }

    fn field_at(&self, index: usize) -> Option<Value> {
        (index == 0).then(|| Value::Int(self.0))
    }

    fn ranger(&self) -> Option<Box<dyn Ranger>> {
        Some(Box::new(CountdownRanger { next: self.0, i: 0 }))
    }
}

#[test]
fn host_rangers_drive_range() {
    let mut vars = VarMap::new();
    vars.set("c", Value::object(Countdown(3)));
    check(
        &vars,
        Value::Invalid,
        "custom",
        "{{ range v := c }}{{ v }}{{ end }}",
        "321",
    );
}

#[test]
fn non_rangeable_values_error() {
    let err = render_error(
        &VarMap::new(),
        Value::Int(4),
        "int_ctx",
        "{{ range . }}x{{ end }}",
    );
    assert!(err.contains("not rangeable"), "{err}");
}
