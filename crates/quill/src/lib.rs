//! quill core library.
//!
//! This crate implements the Quill template engine: the frontend (a
//! mode-switching lexer and a recursive-descent parser), the dynamic value
//! model, and the tree-walking evaluator, plus the shared pieces the
//! end-user tooling builds on — the template Set with its loaders and
//! cache, the default function library, and the escaping helpers.
//!
//! A template embeds expressions, control flow and composition directives
//! in arbitrary text. Sources are addressed by name through a [`Set`],
//! which parses them once and caches the immutable trees; rendering walks
//! a tree against a writer, a variable map and a context value:
//!
//! ```no_run
//! use quill::{InMemLoader, Set, Value, VarMap};
//!
//! let loader = InMemLoader::new();
//! loader.add("hello", "hello {{ name }}!");
//! let set = Set::new(loader);
//!
//! let mut vars = VarMap::new();
//! vars.set("name", "world");
//! let mut out = Vec::new();
//! set.render("hello", &mut out, &vars, Value::Invalid).unwrap();
//! assert_eq!(out, b"hello world!");
//! ```

pub mod ast;
pub mod diagnostics;
pub mod escape;
pub mod eval;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod position;
pub mod ranger;
pub mod runtime;
pub mod set;
pub mod stdlib;
pub mod tokens;
pub mod value;

pub use diagnostics::{QuillError, QuillResult};
pub use loader::{InMemLoader, Loader, OsLoader};
pub use ranger::{Ranger, Stream};
pub use runtime::{Runtime, Translator};
pub use set::{Set, Template, DEFAULT_EXTENSIONS};
pub use tokens::{Keyword, Symbol, Token, TokenKind};
pub use value::{Arguments, Function, Kind, Record, Renderer, SafeWriter, Value, VarMap};

// Re-exported for `Record` implementors; field names are interned.
pub use smol_str::SmolStr;

/// Version of the quill crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
