#![allow(dead_code)]

use quill::{Arguments, InMemLoader, QuillResult, Record, Set, SmolStr, Value, VarMap};

/// Render `content` under `name` in a fresh escaping-free Set.
pub fn run(vars: &VarMap, context: Value, name: &str, content: &str) -> String {
    let set = Set::new(InMemLoader::new());
    run_with_set(&set, vars, context, name, content)
}

/// Render against an existing Set; an empty `content` resolves `name`
/// through the Set instead.
pub fn run_with_set(
    set: &Set,
    vars: &VarMap,
    context: Value,
    name: &str,
    content: &str,
) -> String {
    let template = if content.is_empty() {
        set.get_template(name)
            .unwrap_or_else(|e| panic!("loading {name}: {e}"))
    } else {
        set.load_template(name, content)
            .unwrap_or_else(|e| panic!("parsing {name}: {e}"))
    };
    let mut out = Vec::new();
    template
        .execute(set, &mut out, vars, context)
        .unwrap_or_else(|e| panic!("executing {name}: {e}"));
    String::from_utf8(out).expect("output is utf-8")
}

pub fn check(vars: &VarMap, context: Value, name: &str, content: &str, expected: &str) {
    let got = run(vars, context, name, content);
    assert_eq!(got, expected, "template {name}: {content}");
}

pub fn render_error(vars: &VarMap, context: Value, name: &str, content: &str) -> String {
    let set = Set::new(InMemLoader::new());
    let template = set
        .load_template(name, content)
        .unwrap_or_else(|e| panic!("parsing {name}: {e}"));
    let mut out = Vec::new();
    match template.execute(&set, &mut out, vars, context) {
        Ok(()) => panic!("expected {name} to fail"),
        Err(err) => err.to_string(),
    }
}

/// A host record with fields and methods, as templates see them.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub email: String,
}

impl User {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
        }
    }
}

impl Record for User {
    fn type_name(&self) -> &'static str {
        "User"
    }

    fn field_names(&self) -> Vec<SmolStr> {
        vec![SmolStr::new_inline("Name"), SmolStr::new_inline("Email")]
    }

    fn field_at(&self, index: usize) -> Option<Value> {
        match index {
            0 => Some(Value::from(self.name.as_str())),
            1 => Some(Value::from(self.email.as_str())),
            _ => None,
        }
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(name, "Format" | "GetName")
    }

    fn call_method(&self, name: &str, args: Arguments) -> QuillResult<Value> {
        match name {
            "Format" => {
                let pattern = args.string("Format", 0)?;
                let formatted = pattern
                    .replacen("%s", &self.name, 1)
                    .replacen("%s", &self.email, 1);
                Ok(Value::from(formatted))
            }
            "GetName" => Ok(Value::from(self.name.as_str())),
            other => Err(quill::diagnostics::simple_error(format!(
                "no method {other:?} on User"
            ))),
        }
    }
}
