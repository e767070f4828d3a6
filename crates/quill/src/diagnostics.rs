use std::fmt;
use thiserror::Error;

/// The error type shared by every stage of the engine.
///
/// Parse-time failures always abort and carry the name the template was
/// parsed under plus the line the lexer had reached. Runtime failures carry
/// the name of the template that was executing when the error surfaced.
#[derive(Debug, Error)]
pub enum QuillError {
    #[error("template: {name}:{line}: {message}")]
    Parse {
        name: String,
        line: u32,
        message: String,
    },
    #[error("Jet Runtime Error ({name}:{line}): {message}")]
    Runtime {
        name: String,
        line: u32,
        message: String,
    },
    #[error("template {0} could not be found")]
    TemplateNotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QuillError {
    pub fn parse(name: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        QuillError::Parse {
            name: name.into(),
            line,
            message: message.into(),
        }
    }

    pub fn runtime(name: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        QuillError::Runtime {
            name: name.into(),
            line,
            message: message.into(),
        }
    }

    /// The bare message, without the location prefix. This is what a
    /// `catch` binding observes inside a template.
    pub fn message(&self) -> String {
        match self {
            QuillError::Parse { message, .. } | QuillError::Runtime { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

pub type QuillResult<T, E = QuillError> = std::result::Result<T, E>;

/// Helper used by fallible display paths that need an error value without a
/// template position.
pub fn simple_error(message: impl fmt::Display) -> QuillError {
    QuillError::Other(anyhow::anyhow!("{message}"))
}
