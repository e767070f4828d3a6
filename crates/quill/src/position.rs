use serde::{Deserialize, Serialize};
use std::fmt;

/// A zero-based byte offset into a template source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash, Default)]
pub struct Pos(pub usize);

impl Pos {
    #[inline]
    pub fn new(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Count the 1-based line number of a byte offset within `src`.
///
/// The lexer stamps lines on tokens as it goes; this helper exists for
/// callers that only kept an offset around.
pub fn line_of(src: &str, offset: usize) -> u32 {
    let upto = offset.min(src.len());
    1 + src.as_bytes()[..upto].iter().filter(|&&b| b == b'\n').count() as u32
}
