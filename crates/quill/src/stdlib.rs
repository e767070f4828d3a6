use crate::diagnostics::QuillResult;
use crate::escape;
use crate::ranger::IntsRange;
use crate::value::{Arguments, Renderer, Value};
use smol_str::SmolStr;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, OnceLock};

/// Look up a name in the default library; consulted after the scope chain
/// and the Set globals.
pub(crate) fn default_variable(name: &str) -> Option<Value> {
    defaults().get(name).cloned()
}

fn defaults() -> &'static HashMap<SmolStr, Value> {
    static DEFAULTS: OnceLock<HashMap<SmolStr, Value>> = OnceLock::new();
    DEFAULTS.get_or_init(build_defaults)
}

#[derive(Debug)]
struct JsonRenderer(Value);

impl Renderer for JsonRenderer {
    fn render(&self, out: &mut dyn io::Write) -> io::Result<()> {
        serde_json::to_writer(&mut *out, &self.0)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.write_all(b"\n")
    }
}

fn build_defaults() -> HashMap<SmolStr, Value> {
    let mut vars: HashMap<SmolStr, Value> = HashMap::new();

    vars.insert(
        SmolStr::new_inline("lower"),
        Value::native(|_, args: Arguments| {
            args.require("lower", Some(1), Some(1))?;
            Ok(Value::String(args.string("lower", 0)?.to_lowercase()))
        }),
    );
    vars.insert(
        SmolStr::new_inline("upper"),
        Value::native(|_, args: Arguments| {
            args.require("upper", Some(1), Some(1))?;
            Ok(Value::String(args.string("upper", 0)?.to_uppercase()))
        }),
    );
    vars.insert(
        SmolStr::new_inline("trimSpace"),
        Value::native(|_, args: Arguments| {
            args.require("trimSpace", Some(1), Some(1))?;
            Ok(Value::String(args.string("trimSpace", 0)?.trim().to_string()))
        }),
    );
    vars.insert(
        SmolStr::new_inline("hasPrefix"),
        Value::native(|_, args: Arguments| {
            args.require("hasPrefix", Some(2), Some(2))?;
            let s = args.string("hasPrefix", 0)?;
            let prefix = args.string("hasPrefix", 1)?;
            Ok(Value::Bool(s.starts_with(&prefix)))
        }),
    );
    vars.insert(
        SmolStr::new_inline("hasSuffix"),
        Value::native(|_, args: Arguments| {
            args.require("hasSuffix", Some(2), Some(2))?;
            let s = args.string("hasSuffix", 0)?;
            let suffix = args.string("hasSuffix", 1)?;
            Ok(Value::Bool(s.ends_with(&suffix)))
        }),
    );
    vars.insert(
        SmolStr::new_inline("repeat"),
        Value::native(|_, args: Arguments| {
            args.require("repeat", Some(2), Some(2))?;
            let (s, count) = repeat_args(&args)?;
            Ok(Value::String(s.repeat(count)))
        }),
    );
    vars.insert(
        SmolStr::new_inline("replace"),
        Value::native(|_, args: Arguments| {
            args.require("replace", Some(3), Some(4))?;
            let s = args.string("replace", 0)?;
            let from = args.string("replace", 1)?;
            let to = args.string("replace", 2)?;
            let n = if args.len() == 4 {
                args.integer("replace", 3)?
            } else {
                -1
            };
            let replaced = if n < 0 {
                s.replace(&from, &to)
            } else {
                s.replacen(&from, &to, n as usize)
            };
            Ok(Value::String(replaced))
        }),
    );
    vars.insert(
        SmolStr::new_inline("split"),
        Value::native(|_, args: Arguments| {
            args.require("split", Some(2), Some(2))?;
            let s = args.string("split", 0)?;
            let sep = args.string("split", 1)?;
            let parts = s
                .split(sep.as_str())
                .map(|part| Value::String(part.to_string()))
                .collect();
            Ok(Value::list(parts))
        }),
    );

    vars.insert(
        SmolStr::new_inline("map"),
        Value::native(|_, args: Arguments| {
            if args.len() % 2 != 0 {
                return Err(crate::diagnostics::simple_error(
                    "map: invalid number of arguments, expected key/value pairs",
                ));
            }
            let mut entries = BTreeMap::new();
            let mut i = 0;
            while i < args.len() {
                entries.insert(args.get(i).to_string(), args.get(i + 1));
                i += 2;
            }
            Ok(Value::map(entries))
        }),
    );
    vars.insert(
        SmolStr::new_inline("slice"),
        Value::native(|_, args: Arguments| Ok(Value::list(args.into_values()))),
    );
    vars.insert(
        SmolStr::new_inline("array"),
        Value::native(|_, args: Arguments| Ok(Value::list(args.into_values()))),
    );
    vars.insert(
        SmolStr::new_inline("ints"),
        Value::native(|_, args: Arguments| {
            args.require("ints", Some(2), Some(2))?;
            let from = args.integer("ints", 0)?;
            let to = args.integer("ints", 1)?;
            if to < from {
                return Err(crate::diagnostics::simple_error(format!(
                    "ints: invalid range ({from}, {to})"
                )));
            }
            Ok(Value::object(IntsRange { from, to }))
        }),
    );
    vars.insert(
        SmolStr::new_inline("len"),
        Value::native(|_, args: Arguments| {
            args.require("len", Some(1), Some(1))?;
            let len = match args.get(0) {
                Value::String(s) => s.chars().count(),
                Value::Bytes(b) => b.len(),
                Value::List(items) => items.len(),
                Value::Map(entries) => entries.len(),
                Value::Object(rec) => rec.field_names().len(),
                other => {
                    return Err(crate::diagnostics::simple_error(format!(
                        "len: a {} value has no length",
                        other.kind()
                    )))
                }
            };
            Ok(Value::Int(len as i64))
        }),
    );

    vars.insert(
        SmolStr::new_inline("json"),
        Value::native(|_, args: Arguments| {
            args.require("json", Some(1), Some(1))?;
            let encoded = serde_json::to_string(&args.get(0))
                .map_err(|e| crate::diagnostics::simple_error(format!("json: {e}")))?;
            Ok(Value::String(encoded))
        }),
    );
    vars.insert(
        SmolStr::new_inline("writeJson"),
        Value::native(|_, args: Arguments| {
            args.require("writeJson", Some(1), Some(1))?;
            Ok(Value::Renderer(Arc::new(JsonRenderer(args.get(0)))))
        }),
    );

    vars.insert(
        SmolStr::new_inline("html"),
        Value::native(|_, args: Arguments| {
            args.require("html", Some(1), Some(1))?;
            Ok(Value::String(escape::html_escape_string(&args.string("html", 0)?)))
        }),
    );
    vars.insert(
        SmolStr::new_inline("url"),
        Value::native(|_, args: Arguments| {
            args.require("url", Some(1), Some(1))?;
            Ok(Value::String(escape::url_query_escape(&args.string("url", 0)?)))
        }),
    );
    vars.insert(SmolStr::new_inline("safeHtml"), Value::Safe(escape::html_escape));
    vars.insert(SmolStr::new_inline("safeJs"), Value::Safe(escape::js_escape));
    vars.insert(SmolStr::new_inline("unsafe"), Value::Safe(escape::raw_writer));

    vars.insert(
        SmolStr::new_inline("includeIfExists"),
        Value::native(|rt, args: Arguments| {
            args.require("includeIfExists", Some(1), Some(2))?;
            let name = args.string("includeIfExists", 0)?;
            let context = (args.len() == 2).then(|| args.get(1));
            let sibling = rt.current_name().to_string();
            if !rt.set_ref().template_exists(&name, Some(&sibling)) {
                return Ok(Value::Invalid);
            }
            rt.include(&name, context)?;
            Ok(Value::Invalid)
        }),
    );
    vars.insert(
        SmolStr::new_inline("exec"),
        Value::native(|rt, args: Arguments| {
            args.require("exec", Some(1), Some(2))?;
            let name = args.string("exec", 0)?;
            let context = (args.len() == 2).then(|| args.get(1));
            rt.exec(&name, context)
        }),
    );
    vars.insert(
        SmolStr::new_inline("msg"),
        Value::native(|rt, args: Arguments| {
            args.require("msg", Some(1), Some(2))?;
            let key = args.string("msg", 0)?;
            let fallback = if args.len() == 2 {
                args.string("msg", 1)?
            } else {
                key.clone()
            };
            Ok(Value::String(rt.translate(&key, &fallback)))
        }),
    );

    vars
}

/// `repeat` accepts its string and count in either order so it reads
/// naturally both called directly and as a pipeline stage.
fn repeat_args(args: &Arguments) -> QuillResult<(String, usize)> {
    let a = args.get(0);
    let b = args.get(1);
    match (&a, &b) {
        (Value::String(s), other) => Ok((s.clone(), int_count(other)?)),
        (other, Value::String(s)) => Ok((s.clone(), int_count(other)?)),
        _ => Err(crate::diagnostics::simple_error(
            "repeat: expected a string and a count",
        )),
    }
}

fn int_count(v: &Value) -> QuillResult<usize> {
    crate::value::to_int(v)
        .map_err(crate::diagnostics::simple_error)
        .map(|n| n.max(0) as usize)
}
