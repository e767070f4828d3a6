use crate::position::Pos;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keyword {
    If,
    Else,
    End,
    Range,
    Block,
    Yield,
    Content,
    Include,
    Import,
    Extends,
    Return,
    Try,
    Catch,
    New,
    Nil,
}

impl Keyword {
    pub fn from_ident(ident: &str) -> Option<Self> {
        use Keyword::*;
        let kw = match ident {
            "if" => If,
            "else" => Else,
            "end" => End,
            "range" => Range,
            "block" => Block,
            "yield" => Yield,
            "content" => Content,
            "include" => Include,
            "import" => Import,
            "extends" => Extends,
            "return" => Return,
            "try" => Try,
            "catch" => Catch,
            "new" => New,
            "nil" => Nil,
            _ => return None,
        };
        Some(kw)
    }

    pub fn as_str(&self) -> &'static str {
        use Keyword::*;
        match self {
            If => "if",
            Else => "else",
            End => "end",
            Range => "range",
            Block => "block",
            Yield => "yield",
            Content => "content",
            Include => "include",
            Import => "import",
            Extends => "extends",
            Return => "return",
            Try => "try",
            Catch => "catch",
            New => "new",
            Nil => "nil",
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbol {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    Assign,
    Declare,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Pipe,
    Question,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Symbol::*;
        let s = match self {
            LParen => "(",
            RParen => ")",
            LBracket => "[",
            RBracket => "]",
            Comma => ",",
            Colon => ":",
            Semicolon => ";",
            Assign => "=",
            Declare => ":=",
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            Percent => "%",
            EqEq => "==",
            NotEq => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            AndAnd => "&&",
            OrOr => "||",
            Not => "!",
            Pipe => "|",
            Question => "?",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TokenKind {
    /// Literal template text between actions.
    Text(String),
    LeftDelim,
    RightDelim,
    Identifier(SmolStr),
    /// One `.ident` segment; a bare `.` lexes as `Identifier(".")`.
    Field(SmolStr),
    /// Raw literal text of a number; conversion happens in the parser.
    Number(SmolStr),
    /// Quoted string: the decoded value.
    Str(String),
    /// Backtick-delimited raw string: the verbatim value.
    RawStr(String),
    Bool(bool),
    Keyword(Keyword),
    Symbol(Symbol),
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Text(_) => "text".to_string(),
            TokenKind::LeftDelim => "left delimiter".to_string(),
            TokenKind::RightDelim => "right delimiter".to_string(),
            TokenKind::Identifier(name) => format!("identifier {name:?}"),
            TokenKind::Field(name) => format!("field .{name}"),
            TokenKind::Number(text) => format!("number {text}"),
            TokenKind::Str(value) => format!("string {value:?}"),
            TokenKind::RawStr(value) => format!("raw string {value:?}"),
            TokenKind::Bool(value) => format!("boolean {value}"),
            TokenKind::Keyword(kw) => format!("keyword {kw}"),
            TokenKind::Symbol(sym) => format!("{sym}"),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Pos,
    pub line: u32,
}

impl Token {
    pub fn new(kind: TokenKind, pos: Pos, line: u32) -> Self {
        Self { kind, pos, line }
    }

    pub fn is_symbol(&self, symbol: Symbol) -> bool {
        matches!(self.kind, TokenKind::Symbol(s) if s == symbol)
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        matches!(self.kind, TokenKind::Keyword(k) if k == keyword)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.describe())
    }
}
