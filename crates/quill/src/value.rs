use crate::diagnostics::{QuillError, QuillResult};
use crate::ranger::Ranger;
use crate::runtime::Runtime;
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::Serialize;
use smol_str::SmolStr;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::sync::{Arc, RwLock};

/// Kind tag of a [`Value`], used in error messages and coercion decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Invalid,
    Bool,
    Int,
    Uint,
    Float,
    String,
    Bytes,
    List,
    Map,
    Func,
    Renderer,
    SafeWriter,
    Object,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        use Kind::*;
        match self {
            Invalid => "invalid",
            Bool => "bool",
            Int => "int",
            Uint => "uint",
            Float => "float",
            String => "string",
            Bytes => "bytes",
            List => "list",
            Map => "map",
            Func => "func",
            Renderer => "renderer",
            SafeWriter => "safe writer",
            Object => "object",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Writer-wrapping escape function. Called in place of a raw write whenever
/// a value reaches the output, and usable as a first-class template value
/// (`safeHtml`, `unsafe`, ...) that must terminate its pipeline.
pub type SafeWriter = fn(&mut dyn io::Write, &[u8]) -> io::Result<()>;

/// Values implementing this render themselves instead of being formatted
/// and escaped.
pub trait Renderer: fmt::Debug + Send + Sync {
    fn render(&self, out: &mut dyn io::Write) -> io::Result<()>;
}

/// The opaque-record capability: a host type exposing named/indexed fields
/// and optional methods to templates. Field-name resolution is served
/// through a per-type index cache, so `field_names` is consulted once per
/// type for the lifetime of the process.
pub trait Record: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn field_names(&self) -> Vec<SmolStr>;
    fn field_at(&self, index: usize) -> Option<Value>;

    fn has_method(&self, _name: &str) -> bool {
        false
    }

    fn call_method(&self, name: &str, _args: Arguments) -> QuillResult<Value> {
        Err(QuillError::Other(anyhow::anyhow!(
            "no method {name:?} on {}",
            self.type_name()
        )))
    }

    /// Iteration capability; a record returning a ranger here can stand on
    /// the right side of a `range`.
    fn ranger(&self) -> Option<Box<dyn Ranger>> {
        None
    }
}

type NativeImpl = dyn Fn(&mut Runtime<'_>, Arguments) -> QuillResult<Value> + Send + Sync;

#[derive(Clone)]
pub enum Function {
    Native(Arc<NativeImpl>),
    /// A method bound to its receiver during field resolution.
    Method {
        recv: Arc<dyn Record>,
        name: SmolStr,
    },
}

impl Function {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&mut Runtime<'_>, Arguments) -> QuillResult<Value> + Send + Sync + 'static,
    {
        Function::Native(Arc::new(f))
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Native(_) => write!(f, "Native(..)"),
            Function::Method { recv, name } => {
                write!(f, "Method({}.{name})", recv.type_name())
            }
        }
    }
}

/// Reified argument pack handed to native functions. The piped value of a
/// pipeline stage arrives appended as the last argument unless the call
/// pinned it with a `_` placeholder.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: Vec<Value>,
}

impl Arguments {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument by index; out of range yields the invalid value.
    pub fn get(&self, index: usize) -> Value {
        self.values.get(index).cloned().unwrap_or(Value::Invalid)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Fail unless the argument count lies in `[min, max]`; pass `None`
    /// for an open bound.
    pub fn require(&self, name: &str, min: Option<usize>, max: Option<usize>) -> QuillResult<()> {
        let n = self.values.len();
        let ok = min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m);
        if ok {
            Ok(())
        } else {
            Err(QuillError::Other(anyhow::anyhow!(
                "unexpected number of arguments in a call to {name}"
            )))
        }
    }

    pub fn string(&self, name: &str, index: usize) -> QuillResult<String> {
        match self.get(index) {
            Value::String(s) => Ok(s),
            other => Err(QuillError::Other(anyhow::anyhow!(
                "{name}: argument {index} must be a string, got {}",
                other.kind()
            ))),
        }
    }

    pub fn integer(&self, name: &str, index: usize) -> QuillResult<i64> {
        let value = self.get(index);
        to_int(&value).map_err(|message| {
            QuillError::Other(anyhow::anyhow!("{name}: argument {index}: {message}"))
        })
    }
}

/// The universal dynamic value.
///
/// `Invalid` doubles as the `nil` literal and as the "not there" result of
/// failed probes: missing map keys and unresolved `isset` arguments produce
/// it rather than an error.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Invalid,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Arc<[u8]>),
    List(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    Func(Function),
    Renderer(Arc<dyn Renderer>),
    Safe(SafeWriter),
    Object(Arc<dyn Record>),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Invalid => Kind::Invalid,
            Value::Bool(_) => Kind::Bool,
            Value::Int(_) => Kind::Int,
            Value::Uint(_) => Kind::Uint,
            Value::Float(_) => Kind::Float,
            Value::String(_) => Kind::String,
            Value::Bytes(_) => Kind::Bytes,
            Value::List(_) => Kind::List,
            Value::Map(_) => Kind::Map,
            Value::Func(_) => Kind::Func,
            Value::Renderer(_) => Kind::Renderer,
            Value::Safe(_) => Kind::SafeWriter,
            Value::Object(_) => Kind::Object,
        }
    }

    /// Type name for error messages; records report their own.
    pub fn type_name(&self) -> String {
        match self {
            Value::Object(rec) => rec.type_name().to_string(),
            other => other.kind().as_str().to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }

    pub fn list(values: Vec<Value>) -> Self {
        Value::List(Arc::new(values))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Arc::new(entries))
    }

    pub fn object(record: impl Record + 'static) -> Self {
        Value::Object(Arc::new(record))
    }

    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&mut Runtime<'_>, Arguments) -> QuillResult<Value> + Send + Sync + 'static,
    {
        Value::Func(Function::native(f))
    }

    /// Truthiness: a value is truthy iff it is valid and not the zero of
    /// its kind; sequences and maps when non-empty, records when every
    /// field is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Invalid => false,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Uint(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Func(_) | Value::Renderer(_) | Value::Safe(_) => true,
            Value::Object(rec) => {
                let count = rec.field_names().len();
                (0..count).all(|i| rec.field_at(i).map_or(false, |v| v.is_truthy()))
            }
        }
    }

    /// Equality in the engine's semantics: numeric kinds compare after
    /// widening, composites compare element-wise, callables and writers
    /// compare by identity.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Invalid, Value::Invalid) => true,
            (Value::Invalid, _) | (_, Value::Invalid) => false,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (a, b) if is_numeric(a.kind()) && is_numeric(b.kind()) => numeric_equal(a, b),
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map_or(false, |w| v.equals(w)))
            }
            (Value::Object(a), Value::Object(b)) => {
                if a.type_name() != b.type_name() {
                    return false;
                }
                let count = a.field_names().len();
                (0..count).all(|i| match (a.field_at(i), b.field_at(i)) {
                    (Some(x), Some(y)) => x.equals(&y),
                    (None, None) => true,
                    _ => false,
                })
            }
            (Value::Func(Function::Native(a)), Value::Func(Function::Native(b))) => {
                Arc::ptr_eq(a, b)
            }
            (Value::Safe(a), Value::Safe(b)) => std::ptr::eq(*a as *const (), *b as *const ()),
            (Value::Renderer(a), Value::Renderer(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

pub fn is_numeric(kind: Kind) -> bool {
    matches!(kind, Kind::Int | Kind::Uint | Kind::Float)
}

fn numeric_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            to_float(a).ok() == to_float(b).ok()
        }
        _ => widen(a) == widen(b),
    }
}

/// Signed/unsigned integers compare through a 128-bit widening so that
/// values past `i64::MAX` stay exact.
fn widen(v: &Value) -> i128 {
    match v {
        Value::Int(n) => *n as i128,
        Value::Uint(n) => *n as i128,
        Value::Float(n) => *n as i128,
        _ => 0,
    }
}

pub fn to_int(v: &Value) -> Result<i64, String> {
    match v {
        Value::Int(n) => Ok(*n),
        Value::Uint(n) => Ok(*n as i64),
        Value::Float(n) => Ok(*n as i64),
        other => Err(format!("type {} can't be converted to int", other.type_name())),
    }
}

pub fn to_uint(v: &Value) -> Result<u64, String> {
    match v {
        Value::Uint(n) => Ok(*n),
        Value::Int(n) => Ok(*n as u64),
        Value::Float(n) => Ok(*n as u64),
        other => Err(format!("type {} can't be converted to uint", other.type_name())),
    }
}

pub fn to_float(v: &Value) -> Result<f64, String> {
    match v {
        Value::Float(n) => Ok(*n),
        Value::Int(n) => Ok(*n as f64),
        Value::Uint(n) => Ok(*n as f64),
        other => Err(format!("type {} can't be converted to float", other.type_name())),
    }
}

/// Outcome of resolving one segment of a field chain.
pub enum FieldLookup {
    Found(Value),
    /// Map key absent — an invalid value, not an error, so `isset` probes
    /// stay clean.
    MissingKey,
    NoSuchField,
}

pub fn resolve_field(key: &str, base: &Value) -> FieldLookup {
    match base {
        Value::Map(entries) => match entries.get(key) {
            Some(value) => FieldLookup::Found(value.clone()),
            None => FieldLookup::MissingKey,
        },
        Value::Object(rec) => {
            if rec.has_method(key) {
                return FieldLookup::Found(Value::Func(Function::Method {
                    recv: Arc::clone(rec),
                    name: SmolStr::new(key),
                }));
            }
            match record_field(rec, key) {
                Some(value) => FieldLookup::Found(value),
                None => FieldLookup::NoSuchField,
            }
        }
        _ => FieldLookup::NoSuchField,
    }
}

// Build-once field-name -> index maps, keyed by record type name. Many
// readers, one writer on first sight of a type.
static FIELD_INDEX: RwLock<Option<HashMap<&'static str, Arc<HashMap<SmolStr, usize>>>>> =
    RwLock::new(None);

fn field_index_for(rec: &Arc<dyn Record>) -> Arc<HashMap<SmolStr, usize>> {
    let type_name = rec.type_name();
    if let Some(cache) = FIELD_INDEX.read().expect("field index poisoned").as_ref() {
        if let Some(index) = cache.get(type_name) {
            return Arc::clone(index);
        }
    }
    let mut guard = FIELD_INDEX.write().expect("field index poisoned");
    let cache = guard.get_or_insert_with(HashMap::new);
    if let Some(index) = cache.get(type_name) {
        return Arc::clone(index);
    }
    let index: Arc<HashMap<SmolStr, usize>> = Arc::new(
        rec.field_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect(),
    );
    cache.insert(type_name, Arc::clone(&index));
    index
}

pub fn record_field(rec: &Arc<dyn Record>, name: &str) -> Option<Value> {
    let index = field_index_for(rec);
    index.get(name).and_then(|&i| rec.field_at(i))
}

/// Index a value: sequences by integer (out of range is an error), maps by
/// stringified key (missing keys are invalid, not errors), records by
/// field index or field name.
pub fn index_value(base: &Value, index: &Value) -> Result<Value, String> {
    match base {
        Value::List(items) => {
            let i = to_int(index).map_err(|_| {
                format!("non numeric value in index expression on {}", base.kind())
            })?;
            if i < 0 || i as usize >= items.len() {
                return Err(format!(
                    "list index out of range (index: {i}, len: {})",
                    items.len()
                ));
            }
            Ok(items[i as usize].clone())
        }
        Value::String(s) => {
            let i = to_int(index).map_err(|_| {
                format!("non numeric value in index expression on {}", base.kind())
            })?;
            let chars: Vec<char> = s.chars().collect();
            if i < 0 || i as usize >= chars.len() {
                return Err(format!(
                    "string index out of range (index: {i}, len: {})",
                    chars.len()
                ));
            }
            Ok(Value::String(chars[i as usize].to_string()))
        }
        Value::Map(entries) => {
            let key = index_key(index)?;
            Ok(entries.get(&key).cloned().unwrap_or(Value::Invalid))
        }
        Value::Object(rec) => match index {
            Value::String(name) => match resolve_field(name, base) {
                FieldLookup::Found(value) => Ok(value),
                _ => Err(format!("no field {name:?} in {}", rec.type_name())),
            },
            other if is_numeric(other.kind()) => {
                let i = to_int(other).unwrap_or(-1);
                if i < 0 {
                    return Err(format!(
                        "field index {i} out of range in {}",
                        rec.type_name()
                    ));
                }
                rec.field_at(i as usize).ok_or_else(|| {
                    format!("field index {i} out of range in {}", rec.type_name())
                })
            }
            other => Err(format!(
                "{} is not usable as a field index on {}",
                other.kind(),
                rec.type_name()
            )),
        },
        other => Err(format!("indexing is not supported on {}", other.type_name())),
    }
}

/// Map keys accept anything convertible to a string key.
pub fn index_key(index: &Value) -> Result<String, String> {
    match index {
        Value::String(s) => Ok(s.clone()),
        Value::Int(_) | Value::Uint(_) | Value::Float(_) | Value::Bool(_) => {
            Ok(index.to_string())
        }
        other => Err(format!("{} is not usable as a map key", other.kind())),
    }
}

pub fn slice_value(
    base: &Value,
    start: Option<i64>,
    end: Option<i64>,
) -> Result<Value, String> {
    match base {
        Value::List(items) => {
            let (from, to) = slice_bounds(start, end, items.len())?;
            Ok(Value::list(items[from..to].to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (from, to) = slice_bounds(start, end, chars.len())?;
            Ok(Value::String(chars[from..to].iter().collect()))
        }
        other => Err(format!("slicing is not supported on {}", other.type_name())),
    }
}

fn slice_bounds(
    start: Option<i64>,
    end: Option<i64>,
    len: usize,
) -> Result<(usize, usize), String> {
    let from = start.unwrap_or(0);
    let to = end.unwrap_or(len as i64);
    if from < 0 || to < from || to as usize > len {
        return Err(format!("slice bounds out of range ({from}:{to}, len: {len})"));
    }
    Ok((from as usize, to as usize))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid => write!(f, "<invalid>"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            Value::Func(_) => write!(f, "<function>"),
            Value::Renderer(_) => write!(f, "<renderer>"),
            Value::Safe(_) => write!(f, "<safe writer>"),
            Value::Object(rec) => {
                write!(f, "{}{{", rec.type_name())?;
                for (i, name) in rec.field_names().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    let value = rec.field_at(i).unwrap_or(Value::Invalid);
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Invalid => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Uint(v) => serializer.serialize_u64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Bytes(v) => serializer.serialize_bytes(v),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries.iter() {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Object(rec) => {
                let names = rec.field_names();
                let mut map = serializer.serialize_map(Some(names.len()))?;
                for (i, name) in names.iter().enumerate() {
                    let value = rec.field_at(i).unwrap_or(Value::Invalid);
                    map.serialize_entry(name.as_str(), &value)?;
                }
                map.end()
            }
            other => Err(S::Error::custom(format!(
                "a {} value cannot be serialized",
                other.kind()
            ))),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Uint(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::list(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::map(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Invalid,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Uint(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::list(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// The identifier -> value mapping supplied to an execution.
#[derive(Debug, Clone, Default)]
pub struct VarMap {
    vars: HashMap<SmolStr, Value>,
}

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<SmolStr>, value: impl Into<Value>) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn set_native<F>(&mut self, name: impl Into<SmolStr>, f: F) -> &mut Self
    where
        F: Fn(&mut Runtime<'_>, Arguments) -> QuillResult<Value> + Send + Sync + 'static,
    {
        self.vars.insert(name.into(), Value::native(f));
        self
    }

    pub fn set_writer(&mut self, name: impl Into<SmolStr>, writer: SafeWriter) -> &mut Self {
        self.vars.insert(name.into(), Value::Safe(writer));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Value)> {
        self.vars.iter()
    }
}
