use crate::ast::List;
use crate::diagnostics::{QuillError, QuillResult};
use crate::escape;
use crate::lexer::{LexerOptions, DEFAULT_LEFT_DELIM, DEFAULT_RIGHT_DELIM};
use crate::loader::{join_sibling, normalize, Loader};
use crate::parser;
use crate::runtime::{BlockMap, Runtime, Translator};
use crate::value::{SafeWriter, Value, VarMap};
use smol_str::SmolStr;
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, RwLock};

/// Extensions tried, in order, when resolving a template name. The empty
/// entry covers names given with their extension already.
pub const DEFAULT_EXTENSIONS: &[&str] = &["", ".quill", ".html.quill", ".quill.html"];

/// One parsed template. Immutable once parsing succeeds; the Set caches and
/// shares it across executions.
#[derive(Debug)]
pub struct Template {
    /// Canonical name the template was stored under.
    pub name: String,
    /// Name used in error messages.
    pub parse_name: String,
    pub(crate) root: Arc<List>,
    pub(crate) extends: Option<Arc<Template>>,
    pub(crate) imports: Vec<Arc<Template>>,
    pub(crate) processed_blocks: Arc<BlockMap>,
}

impl Template {
    /// Render with `writer` receiving the output, `vars` seeding the root
    /// scope and `context` as the initial `.`.
    pub fn execute(
        &self,
        set: &Set,
        writer: &mut dyn io::Write,
        vars: &VarMap,
        context: Value,
    ) -> QuillResult<()> {
        self.execute_i18n(set, None, writer, vars, context)
    }

    pub fn execute_i18n(
        &self,
        set: &Set,
        translator: Option<&dyn Translator>,
        writer: &mut dyn io::Write,
        vars: &VarMap,
        context: Value,
    ) -> QuillResult<()> {
        let mut rt = Runtime::new(
            set,
            writer,
            vars,
            context,
            Arc::clone(&self.processed_blocks),
            translator,
        );
        rt.name_stack.push(self.name.clone());

        // Overrides from this template are already installed in the block
        // table; rendering starts from the root-most parent.
        let mut root = self;
        while let Some(parent) = &root.extends {
            root = parent.as_ref();
        }
        rt.execute_list(&root.root)?;
        Ok(())
    }

    /// Print the template back to source, composition headers included.
    pub fn source(&self) -> String {
        let mut out = String::new();
        if let Some(parent) = &self.extends {
            out.push_str(&format!("{{{{extends \"{}\"}}}}", parent.parse_name));
        }
        for import in &self.imports {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("{{{{import \"{}\"}}}}", import.parse_name));
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.root.to_string());
        out
    }

    pub fn root(&self) -> &List {
        &self.root
    }
}

#[derive(Default)]
pub(crate) struct ParseState {
    /// Names currently being parsed, for the `extends`/`import` cycle
    /// check.
    visiting: Vec<String>,
}

/// The template registry: binds names to parsed templates, owns the
/// loader, the cache, the globals and the rendering configuration.
/// Process-long; safe to share across threads.
pub struct Set {
    loader: Box<dyn Loader>,
    cache: RwLock<HashMap<String, Arc<Template>>>,
    globals: RwLock<HashMap<SmolStr, Value>>,
    escape: Option<SafeWriter>,
    extensions: Vec<String>,
    left_delim: String,
    right_delim: String,
    development_mode: bool,
    abort_on_error: bool,
}

impl Set {
    /// A Set without an escape writer: values are written verbatim.
    pub fn new(loader: impl Loader + 'static) -> Self {
        Self::with_escape(loader, None)
    }

    /// A Set that HTML-escapes every value reaching the output.
    pub fn new_html(loader: impl Loader + 'static) -> Self {
        Self::with_escape(loader, Some(escape::html_escape as SafeWriter))
    }

    pub fn with_escape(loader: impl Loader + 'static, escape: Option<SafeWriter>) -> Self {
        Self {
            loader: Box::new(loader),
            cache: RwLock::new(HashMap::new()),
            globals: RwLock::new(HashMap::new()),
            escape,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            left_delim: DEFAULT_LEFT_DELIM.to_string(),
            right_delim: DEFAULT_RIGHT_DELIM.to_string(),
            development_mode: false,
            abort_on_error: true,
        }
    }

    /// In development mode nothing is cached and every request re-parses.
    pub fn set_development_mode(&mut self, on: bool) -> &mut Self {
        self.development_mode = on;
        self
    }

    /// When disabled, action-evaluation errors are logged and rendering
    /// continues. Parse errors always abort.
    pub fn set_abort_on_error(&mut self, on: bool) -> &mut Self {
        self.abort_on_error = on;
        self
    }

    /// Custom delimiter pair; both must be non-empty and must not start
    /// with a space.
    pub fn set_delims(&mut self, left: &str, right: &str) -> &mut Self {
        assert!(
            !left.is_empty() && !right.is_empty(),
            "delimiters must be non-empty"
        );
        assert!(
            !left.starts_with(' ') && !right.starts_with(' '),
            "delimiters must not start with a space"
        );
        self.left_delim = left.to_string();
        self.right_delim = right.to_string();
        self
    }

    pub fn set_extensions(&mut self, extensions: &[&str]) -> &mut Self {
        self.extensions = extensions.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn add_global(&self, name: impl Into<SmolStr>, value: impl Into<Value>) -> &Self {
        self.globals
            .write()
            .expect("globals poisoned")
            .insert(name.into(), value.into());
        self
    }

    pub fn add_global_fn<F>(&self, name: impl Into<SmolStr>, f: F) -> &Self
    where
        F: Fn(&mut Runtime<'_>, crate::value::Arguments) -> QuillResult<Value>
            + Send
            + Sync
            + 'static,
    {
        self.add_global(name, Value::native(f))
    }

    pub fn lookup_global(&self, name: &str) -> Option<Value> {
        self.globals
            .read()
            .expect("globals poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn escape(&self) -> Option<SafeWriter> {
        self.escape
    }

    pub(crate) fn abort_on_error(&self) -> bool {
        self.abort_on_error
    }

    pub(crate) fn lexer_options(&self) -> LexerOptions {
        LexerOptions {
            left_delim: self.left_delim.clone(),
            right_delim: self.right_delim.clone(),
            trim_markers: true,
        }
    }

    /// Find (and load on first use) the template at `path`, trying each
    /// configured extension first against the cache and then against the
    /// loader. Parsed templates are cached under their canonical name
    /// unless development mode is on.
    pub fn get_template(&self, path: &str) -> QuillResult<Arc<Template>> {
        let mut state = ParseState::default();
        self.get_template_with_state(path, &mut state)
    }

    /// Parse without touching the cache.
    pub fn parse(&self, name: &str, source: &str) -> QuillResult<Arc<Template>> {
        let mut state = ParseState::default();
        self.parse_with_state(name, source, &mut state)
    }

    /// Parse and cache under `name`. A cached template wins over the given
    /// source, so the first load pins the content for the process
    /// lifetime (outside development mode).
    pub fn load_template(&self, name: &str, source: &str) -> QuillResult<Arc<Template>> {
        let name = normalize(name);
        if self.development_mode {
            let mut state = ParseState::default();
            return self.parse_with_state(&name, source, &mut state);
        }
        if let Some(found) = self.cache.read().expect("cache poisoned").get(&name) {
            return Ok(Arc::clone(found));
        }
        let mut state = ParseState::default();
        let template = self.parse_with_state(&name, source, &mut state)?;
        let mut cache = self.cache.write().expect("cache poisoned");
        if let Some(found) = cache.get(&name) {
            return Ok(Arc::clone(found));
        }
        cache.insert(name, Arc::clone(&template));
        Ok(template)
    }

    /// Convenience: resolve `name` and execute it in one call.
    pub fn render(
        &self,
        name: &str,
        writer: &mut dyn io::Write,
        vars: &VarMap,
        context: Value,
    ) -> QuillResult<()> {
        let template = self.get_template(name)?;
        template.execute(self, writer, vars, context)
    }

    /// Probe loader and cache without parsing; used by `includeIfExists`.
    pub(crate) fn template_exists(&self, path: &str, sibling: Option<&str>) -> bool {
        let probe = |path: &str| {
            for extension in &self.extensions {
                let candidate = format!("{path}{extension}");
                if !self.development_mode
                    && self
                        .cache
                        .read()
                        .expect("cache poisoned")
                        .contains_key(&normalize(&candidate))
                {
                    return true;
                }
                if self.loader.exists(&candidate).is_some() {
                    return true;
                }
            }
            false
        };
        if let Some(sibling) = sibling {
            if !path.starts_with('/') && probe(&join_sibling(sibling, path)) {
                return true;
            }
        }
        probe(path)
    }

    fn get_template_with_state(
        &self,
        path: &str,
        state: &mut ParseState,
    ) -> QuillResult<Arc<Template>> {
        let path = normalize(path);
        if !self.development_mode {
            let cache = self.cache.read().expect("cache poisoned");
            for extension in &self.extensions {
                let candidate = format!("{path}{extension}");
                if let Some(found) = cache.get(&candidate) {
                    return Ok(Arc::clone(found));
                }
            }
        }
        self.get_template_from_loader(&path, state)
    }

    fn get_template_from_loader(
        &self,
        path: &str,
        state: &mut ParseState,
    ) -> QuillResult<Arc<Template>> {
        for extension in &self.extensions {
            let candidate = format!("{path}{extension}");
            let Some(canonical) = self.loader.exists(&candidate) else {
                continue;
            };
            let mut source = String::new();
            self.loader.open(&candidate)?.read_to_string(&mut source)?;
            let template = self.parse_with_state(&canonical, &source, state)?;
            if self.development_mode {
                return Ok(template);
            }
            // Double-checked insert: another execution may have parsed the
            // same name while we were outside the lock.
            let mut cache = self.cache.write().expect("cache poisoned");
            if let Some(found) = cache.get(&canonical) {
                return Ok(Arc::clone(found));
            }
            cache.insert(canonical, Arc::clone(&template));
            return Ok(template);
        }
        Err(QuillError::TemplateNotFound(path.to_string()))
    }

    /// Resolve a composition target while parsing `sibling`: the sibling's
    /// directory first, then the bare path.
    pub(crate) fn load_for_parse(
        &self,
        path: &str,
        sibling: &str,
        state: &mut ParseState,
    ) -> QuillResult<Arc<Template>> {
        if !path.starts_with('/') {
            let joined = join_sibling(sibling, path);
            if joined != normalize(path) {
                match self.get_template_with_state(&joined, state) {
                    Err(QuillError::TemplateNotFound(_)) => {}
                    other => return other,
                }
            }
        }
        self.get_template_with_state(path, state)
    }

    /// Render-time counterpart of [`Set::load_for_parse`] for `include`.
    pub(crate) fn get_sibling_template(
        &self,
        path: &str,
        sibling: &str,
    ) -> QuillResult<Arc<Template>> {
        let mut state = ParseState::default();
        self.load_for_parse(path, sibling, &mut state)
    }

    fn parse_with_state(
        &self,
        name: &str,
        source: &str,
        state: &mut ParseState,
    ) -> QuillResult<Arc<Template>> {
        if state.visiting.iter().any(|n| n == name) {
            return Err(QuillError::parse(
                name,
                0,
                format!("circular extends/import chain through {name:?}"),
            ));
        }
        state.visiting.push(name.to_string());
        let parsed = parser::parse_template(self, name, source, state);
        state.visiting.pop();
        let parsed = parsed?;

        let mut processed: BlockMap = HashMap::new();
        if let Some(parent) = &parsed.extends {
            for (key, block) in parent.processed_blocks.iter() {
                processed.insert(key.clone(), Arc::clone(block));
            }
        }
        for import in &parsed.imports {
            for (key, block) in import.processed_blocks.iter() {
                processed.insert(key.clone(), Arc::clone(block));
            }
        }
        for (key, block) in &parsed.passed_blocks {
            processed.insert(key.clone(), Arc::clone(block));
        }

        Ok(Arc::new(Template {
            name: name.to_string(),
            parse_name: name.to_string(),
            root: Arc::new(parsed.root),
            extends: parsed.extends,
            imports: parsed.imports,
            processed_blocks: Arc::new(processed),
        }))
    }
}

/// What the parser hands back to the Set.
pub(crate) struct ParsedTemplate {
    pub(crate) root: List,
    pub(crate) extends: Option<Arc<Template>>,
    pub(crate) imports: Vec<Arc<Template>>,
    pub(crate) passed_blocks: BlockMap,
}
