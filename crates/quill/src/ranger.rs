use crate::diagnostics::{QuillError, QuillResult};
use crate::value::{Record, Value};
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

/// Pull-based iteration capability: each call produces the next
/// `(key, value)` pair, `None` once drained. Kept deliberately non-async —
/// channel-like sources block on receive and end when the sender closes.
pub trait Ranger: Send {
    fn range(&mut self) -> QuillResult<Option<(Value, Value)>>;

    /// Whether the key side of the pair carries a meaningful index.
    fn provides_index(&self) -> bool {
        true
    }
}

/// Ordered-sequence ranger; keys are the element indices.
pub struct ListRanger {
    items: Arc<Vec<Value>>,
    i: usize,
}

impl ListRanger {
    pub fn new(items: Arc<Vec<Value>>) -> Self {
        Self { items, i: 0 }
    }
}

impl Ranger for ListRanger {
    fn range(&mut self) -> QuillResult<Option<(Value, Value)>> {
        if self.i == self.items.len() {
            return Ok(None);
        }
        let pair = (Value::Int(self.i as i64), self.items[self.i].clone());
        self.i += 1;
        Ok(Some(pair))
    }
}

/// Map ranger; keys iterate in map order.
pub struct MapRanger {
    entries: Vec<(String, Value)>,
    i: usize,
}

impl MapRanger {
    pub fn new(entries: &BTreeMap<String, Value>) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            i: 0,
        }
    }
}

impl Ranger for MapRanger {
    fn range(&mut self) -> QuillResult<Option<(Value, Value)>> {
        if self.i == self.entries.len() {
            return Ok(None);
        }
        let (key, value) = self.entries[self.i].clone();
        self.i += 1;
        Ok(Some((Value::String(key), value)))
    }
}

/// Character ranger over a string; values are one-character strings.
pub struct StrRanger {
    chars: Vec<char>,
    i: usize,
}

impl StrRanger {
    pub fn new(s: &str) -> Self {
        Self {
            chars: s.chars().collect(),
            i: 0,
        }
    }
}

impl Ranger for StrRanger {
    fn range(&mut self) -> QuillResult<Option<(Value, Value)>> {
        if self.i == self.chars.len() {
            return Ok(None);
        }
        let pair = (
            Value::Int(self.i as i64),
            Value::String(self.chars[self.i].to_string()),
        );
        self.i += 1;
        Ok(Some(pair))
    }
}

/// The numeric half-open range produced by `ints(from, to)`.
#[derive(Debug, Clone, Copy)]
pub struct IntsRange {
    pub from: i64,
    pub to: i64,
}

impl Record for IntsRange {
    fn type_name(&self) -> &'static str {
        "ints"
    }

    fn field_names(&self) -> Vec<SmolStr> {
        vec![SmolStr::new_inline("from"), SmolStr::new_inline("to")]
    }

    fn field_at(&self, index: usize) -> Option<Value> {
        match index {
            0 => Some(Value::Int(self.from)),
            1 => Some(Value::Int(self.to)),
            _ => None,
        }
    }

    fn ranger(&self) -> Option<Box<dyn Ranger>> {
        Some(Box::new(IntsRanger {
            from: self.from,
            to: self.to,
            i: 0,
        }))
    }
}

pub struct IntsRanger {
    from: i64,
    to: i64,
    i: i64,
}

impl Ranger for IntsRanger {
    fn range(&mut self) -> QuillResult<Option<(Value, Value)>> {
        if self.from + self.i >= self.to {
            return Ok(None);
        }
        let pair = (Value::Int(self.i), Value::Int(self.from + self.i));
        self.i += 1;
        Ok(Some(pair))
    }
}

/// A channel-backed stream of values. `range` over a stream receives until
/// the sending half is dropped; closing the channel is how a host cancels
/// the iteration.
pub struct Stream {
    receiver: Arc<Mutex<Receiver<Value>>>,
}

impl Stream {
    pub fn new(receiver: Receiver<Value>) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stream(..)")
    }
}

impl Record for Stream {
    fn type_name(&self) -> &'static str {
        "stream"
    }

    fn field_names(&self) -> Vec<SmolStr> {
        Vec::new()
    }

    fn field_at(&self, _index: usize) -> Option<Value> {
        None
    }

    fn ranger(&self) -> Option<Box<dyn Ranger>> {
        Some(Box::new(ChannelRanger {
            receiver: Arc::clone(&self.receiver),
        }))
    }
}

pub struct ChannelRanger {
    receiver: Arc<Mutex<Receiver<Value>>>,
}

impl Ranger for ChannelRanger {
    fn range(&mut self) -> QuillResult<Option<(Value, Value)>> {
        let received = self
            .receiver
            .lock()
            .map_err(|_| QuillError::Other(anyhow::anyhow!("stream receiver poisoned")))?
            .recv();
        match received {
            Ok(value) => Ok(Some((Value::Invalid, value))),
            Err(_) => Ok(None),
        }
    }

    fn provides_index(&self) -> bool {
        false
    }
}

/// Acquire a ranger for a value: the Record hook wins, then the built-in
/// rangeable kinds.
pub fn ranger_for(value: &Value) -> Result<Box<dyn Ranger>, String> {
    match value {
        Value::Object(rec) => rec
            .ranger()
            .ok_or_else(|| format!("type {} is not rangeable", rec.type_name())),
        Value::List(items) => Ok(Box::new(ListRanger::new(Arc::clone(items)))),
        Value::Map(entries) => Ok(Box::new(MapRanger::new(entries))),
        Value::String(s) => Ok(Box::new(StrRanger::new(s))),
        Value::Invalid => Err("can't range over invalid value".to_string()),
        other => Err(format!("type {} is not rangeable", other.type_name())),
    }
}
