use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// The minimal contract the Set needs from a template source.
pub trait Loader: Send + Sync {
    /// Probe for a template without committing to read it; returns the
    /// canonical path the template is addressable under.
    fn exists(&self, path: &str) -> Option<String>;

    /// Open a template for reading. The caller consumes and drops the
    /// reader.
    fn open(&self, path: &str) -> io::Result<Box<dyn io::Read>>;
}

/// Loads templates from a directory on the OS file system.
pub struct OsLoader {
    dir: PathBuf,
}

impl OsLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.dir.join(path.trim_start_matches('/'))
    }
}

impl Loader for OsLoader {
    fn exists(&self, path: &str) -> Option<String> {
        let full = self.resolve(path);
        match fs::metadata(&full) {
            Ok(meta) if meta.is_file() => Some(path.trim_start_matches('/').to_string()),
            _ => None,
        }
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn io::Read>> {
        let file = fs::File::open(self.resolve(path))?;
        Ok(Box::new(file))
    }
}

/// A map-backed loader for tests and embedded template sets.
#[derive(Default)]
pub struct InMemLoader {
    templates: RwLock<HashMap<String, String>>,
}

impl InMemLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl Into<String>, source: impl Into<String>) -> &Self {
        let key = normalize(&path.into());
        self.templates
            .write()
            .expect("loader map poisoned")
            .insert(key, source.into());
        self
    }
}

impl Loader for InMemLoader {
    fn exists(&self, path: &str) -> Option<String> {
        let key = normalize(path);
        self.templates
            .read()
            .expect("loader map poisoned")
            .contains_key(&key)
            .then_some(key)
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn io::Read>> {
        let key = normalize(path);
        let guard = self.templates.read().expect("loader map poisoned");
        match guard.get(&key) {
            Some(source) => Ok(Box::new(io::Cursor::new(source.clone().into_bytes()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("template {path} not found"),
            )),
        }
    }
}

/// Resolve `.` and `..` segments lexically, so sibling-relative includes
/// like `../partials/nav` address cache and loader consistently.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Join a relative path onto the directory of a sibling template.
pub fn join_sibling(sibling: &str, path: &str) -> String {
    let dir = Path::new(sibling)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    if dir.is_empty() {
        normalize(path)
    } else {
        normalize(&format!("{dir}/{path}"))
    }
}
