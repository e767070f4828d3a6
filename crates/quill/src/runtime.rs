use crate::ast::{BlockStmt, List};
use crate::diagnostics::QuillError;
use crate::set::Set;
use crate::value::{SafeWriter, Value, VarMap};
use smol_str::SmolStr;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Host hook for message translation; installed per execution via
/// `Template::execute_i18n` and consulted by the `msg` helper.
pub trait Translator: Send + Sync {
    fn msg(&self, key: &str, default_value: &str) -> String;
    fn trans(&self, format: &str, default_format: &str, args: &[Value]) -> String;
}

pub(crate) type BlockMap = HashMap<SmolStr, Arc<BlockStmt>>;

/// One frame in the lexical chain. Each frame carries the block table that
/// was current when it was pushed, so block lookup walks outward with the
/// variables.
pub(crate) struct Frame {
    pub(crate) vars: HashMap<SmolStr, Value>,
    pub(crate) blocks: Arc<BlockMap>,
}

/// A content body captured at a yield site, together with the scope depth
/// it closed over. Invoking it evaluates the body in the caller's scope.
#[derive(Clone)]
pub(crate) struct ContentCont {
    pub(crate) body: Arc<List>,
    pub(crate) frame_len: usize,
    pub(crate) prev: Option<Box<ContentCont>>,
}

pub(crate) enum Out<'w> {
    Writer(&'w mut dyn io::Write),
    /// Output discarded; used while `exec` runs a template for its return
    /// value.
    Sink,
}

/// The state of a single execution: writer, scope chain, implicit context,
/// block tables and the content continuation. Exclusively owned by one
/// render; the Set it references is shared and immutable.
pub struct Runtime<'r> {
    pub(crate) set: &'r Set,
    pub(crate) out: Out<'r>,
    pub(crate) escape: Option<SafeWriter>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) context: Value,
    pub(crate) content: Option<ContentCont>,
    pub(crate) translator: Option<&'r dyn Translator>,
    /// Names of the templates on the execution stack; the top names the
    /// template currently executing, for error messages and relative
    /// includes.
    pub(crate) name_stack: Vec<String>,
}

impl<'r> Runtime<'r> {
    pub(crate) fn new(
        set: &'r Set,
        out: &'r mut dyn io::Write,
        vars: &VarMap,
        context: Value,
        blocks: Arc<BlockMap>,
        translator: Option<&'r dyn Translator>,
    ) -> Self {
        let mut root_vars = HashMap::new();
        for (name, value) in vars.iter() {
            root_vars.insert(name.clone(), value.clone());
        }
        Self {
            set,
            out: Out::Writer(out),
            escape: set.escape(),
            frames: vec![Frame { vars: root_vars, blocks }],
            context,
            content: None,
            translator,
            name_stack: Vec::new(),
        }
    }

    pub(crate) fn push_scope(&mut self) {
        let blocks = Arc::clone(&self.top_frame().blocks);
        self.frames.push(Frame { vars: HashMap::new(), blocks });
    }

    pub(crate) fn push_scope_with_blocks(&mut self, blocks: Arc<BlockMap>) {
        self.frames.push(Frame { vars: HashMap::new(), blocks });
    }

    pub(crate) fn pop_scope(&mut self) {
        debug_assert!(self.frames.len() > 1, "root frame must survive");
        self.frames.pop();
    }

    fn top_frame(&self) -> &Frame {
        self.frames.last().expect("at least the root frame")
    }

    /// Declare `name` in the current frame.
    pub(crate) fn declare(&mut self, name: &SmolStr, value: Value) {
        if name == "_" {
            return;
        }
        self.frames
            .last_mut()
            .expect("at least the root frame")
            .vars
            .insert(name.clone(), value);
    }

    /// Assign to the nearest enclosing frame that already defines `name`.
    ///
    /// When no frame defines it the write is silently dropped: seed the
    /// variable map with the name before executing if you need the
    /// assignment to land. This mirrors the engine's documented behaviour
    /// and never panics.
    pub(crate) fn assign(&mut self, name: &SmolStr, value: Value) {
        if name == "_" {
            return;
        }
        for frame in self.frames.iter_mut().rev() {
            if frame.vars.contains_key(name) {
                frame.vars.insert(name.clone(), value);
                return;
            }
        }
    }

    /// Resolution order: scope chain, then Set globals, then the default
    /// library. Unknown names resolve to the invalid value.
    pub fn resolve(&self, name: &str) -> Value {
        if name == "." {
            return self.context.clone();
        }
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.vars.get(name) {
                return value.clone();
            }
        }
        if let Some(value) = self.set.lookup_global(name) {
            return value;
        }
        crate::stdlib::default_variable(name).unwrap_or(Value::Invalid)
    }

    pub(crate) fn lookup_block(&self, name: &str) -> Option<Arc<BlockStmt>> {
        for frame in self.frames.iter().rev() {
            if let Some(block) = frame.blocks.get(name) {
                return Some(Arc::clone(block));
            }
        }
        None
    }

    /// The current implicit `.` value.
    pub fn context(&self) -> Value {
        self.context.clone()
    }

    pub fn set_ref(&self) -> &Set {
        self.set
    }

    pub fn translate(&self, key: &str, default_value: &str) -> String {
        match self.translator {
            Some(translator) => translator.msg(key, default_value),
            None => default_value.to_string(),
        }
    }

    pub(crate) fn current_name(&self) -> &str {
        self.name_stack.last().map(String::as_str).unwrap_or("<template>")
    }

    pub(crate) fn error(&self, line: u32, message: impl Into<String>) -> QuillError {
        QuillError::runtime(self.current_name(), line, message)
    }

    pub(crate) fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.out {
            Out::Writer(w) => w.write_all(bytes),
            Out::Sink => Ok(()),
        }
    }

    /// Write through the Set's escape writer when one is configured.
    pub(crate) fn write_escaped(&mut self, bytes: &[u8]) -> io::Result<()> {
        match (&mut self.out, self.escape) {
            (Out::Writer(w), Some(escape)) => escape(&mut **w, bytes),
            (Out::Writer(w), None) => w.write_all(bytes),
            (Out::Sink, _) => Ok(()),
        }
    }

    /// Write through an explicit safe writer, bypassing the Set's escape
    /// step.
    pub(crate) fn write_safe(&mut self, writer: SafeWriter, bytes: &[u8]) -> io::Result<()> {
        match &mut self.out {
            Out::Writer(w) => writer(&mut **w, bytes),
            Out::Sink => Ok(()),
        }
    }

    pub(crate) fn render_value(&mut self, value: &Value) -> io::Result<()> {
        match value {
            Value::Renderer(renderer) => match &mut self.out {
                Out::Writer(w) => renderer.render(&mut **w),
                Out::Sink => Ok(()),
            },
            Value::Bytes(bytes) => {
                let owned = Arc::clone(bytes);
                self.write_escaped(&owned)
            }
            other => {
                let text = other.to_string();
                self.write_escaped(text.as_bytes())
            }
        }
    }
}
