use crate::position::Pos;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;

/// A sequence of statements. Template roots, branch bodies, and block
/// bodies are all lists.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct List {
    pub pos: Pos,
    pub nodes: Vec<Stmt>,
}

impl List {
    pub fn new(pos: Pos) -> Self {
        Self { pos, nodes: Vec::new() }
    }

    pub fn append(&mut self, stmt: Stmt) {
        self.nodes.push(stmt);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    Text(TextStmt),
    Action(Box<ActionStmt>),
    If(Box<IfStmt>),
    Range(Box<RangeStmt>),
    /// Shared so the Set can hand the same definition to block tables of
    /// extending and importing templates.
    Block(Arc<BlockStmt>),
    Yield(Box<YieldStmt>),
    Include(Box<IncludeStmt>),
    Return(Box<ReturnStmt>),
    Try(Box<TryStmt>),
}

impl Stmt {
    pub fn line(&self) -> u32 {
        match self {
            Stmt::Text(n) => n.line,
            Stmt::Action(n) => n.line,
            Stmt::If(n) => n.line,
            Stmt::Range(n) => n.line,
            Stmt::Block(n) => n.line,
            Stmt::Yield(n) => n.line,
            Stmt::Include(n) => n.line,
            Stmt::Return(n) => n.line,
            Stmt::Try(n) => n.line,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextStmt {
    pub pos: Pos,
    pub line: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStmt {
    pub pos: Pos,
    pub line: u32,
    pub set: Option<SetClause>,
    pub pipe: Option<Pipeline>,
}

/// `a, b := x, y` or `a = x`; `decl` distinguishes `:=` from `=`.
/// `index_lookup` marks the two-target single-index form
/// `v, ok := m[key]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetClause {
    pub pos: Pos,
    pub line: u32,
    pub decl: bool,
    pub index_lookup: bool,
    pub left: Vec<Expr>,
    pub right: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfStmt {
    pub pos: Pos,
    pub line: u32,
    pub set: Option<SetClause>,
    pub cond: Expr,
    pub then_list: List,
    pub else_list: Option<List>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeStmt {
    pub pos: Pos,
    pub line: u32,
    /// `range k, v := producer` form; the producer is `right[0]`.
    pub set: Option<SetClause>,
    /// bare `range producer` form.
    pub expr: Option<Expr>,
    pub body: List,
    pub else_list: Option<List>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockParam {
    pub name: SmolStr,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlockParams {
    pub list: Vec<BlockParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStmt {
    pub pos: Pos,
    pub line: u32,
    pub name: SmolStr,
    pub params: BlockParams,
    /// Implicit-context expression evaluated when the block runs.
    pub context: Option<Expr>,
    pub body: Arc<List>,
    /// The list after a `{{content}}` divider inside the body, rendered by
    /// `yield content` when the block define-and-yields.
    pub content: Option<Arc<List>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldArg {
    pub name: Option<SmolStr>,
    pub value: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum YieldKind {
    /// `yield content` — invoke the content continuation captured at the
    /// nearest enclosing yield site.
    Content { context: Option<Expr> },
    Block {
        name: SmolStr,
        args: Vec<YieldArg>,
        context: Option<Expr>,
        content: Option<Arc<List>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldStmt {
    pub pos: Pos,
    pub line: u32,
    pub kind: YieldKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludeStmt {
    pub pos: Pos,
    pub line: u32,
    /// String literal or any expression evaluating to a string at render
    /// time.
    pub name: Expr,
    pub context: Option<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnStmt {
    pub pos: Pos,
    pub line: u32,
    pub value: Option<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryStmt {
    pub pos: Pos,
    pub line: u32,
    pub body: List,
    pub catch_ident: Option<SmolStr>,
    pub catch_body: Option<List>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub pos: Pos,
    pub line: u32,
    pub cmds: Vec<Command>,
}

/// One pipeline stage: a base expression, optionally applied to arguments
/// with the `base: a, b` colon form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub pos: Pos,
    pub line: u32,
    pub base: Expr,
    pub call: bool,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Nil(NilLit),
    Bool(BoolLit),
    Number(Box<NumberLit>),
    Str(Box<StrLit>),
    Ident(IdentExpr),
    Field(Box<FieldExpr>),
    Chain(Box<ChainExpr>),
    Unary(Box<UnaryExpr>),
    Not(Box<NotExpr>),
    Binary(Box<BinaryExpr>),
    Ternary(Box<TernaryExpr>),
    Call(Box<CallExpr>),
    Index(Box<IndexExpr>),
    Slice(Box<SliceExpr>),
    Isset(Box<IssetExpr>),
}

impl Expr {
    pub fn pos(&self) -> Pos {
        match self {
            Expr::Nil(n) => n.pos,
            Expr::Bool(n) => n.pos,
            Expr::Number(n) => n.pos,
            Expr::Str(n) => n.pos,
            Expr::Ident(n) => n.pos,
            Expr::Field(n) => n.pos,
            Expr::Chain(n) => n.pos,
            Expr::Unary(n) => n.pos,
            Expr::Not(n) => n.pos,
            Expr::Binary(n) => n.pos,
            Expr::Ternary(n) => n.pos,
            Expr::Call(n) => n.pos,
            Expr::Index(n) => n.pos,
            Expr::Slice(n) => n.pos,
            Expr::Isset(n) => n.pos,
        }
    }

    pub fn line(&self) -> u32 {
        match self {
            Expr::Nil(n) => n.line,
            Expr::Bool(n) => n.line,
            Expr::Number(n) => n.line,
            Expr::Str(n) => n.line,
            Expr::Ident(n) => n.line,
            Expr::Field(n) => n.line,
            Expr::Chain(n) => n.line,
            Expr::Unary(n) => n.line,
            Expr::Not(n) => n.line,
            Expr::Binary(n) => n.line,
            Expr::Ternary(n) => n.line,
            Expr::Call(n) => n.line,
            Expr::Index(n) => n.line,
            Expr::Slice(n) => n.line,
            Expr::Isset(n) => n.line,
        }
    }

    /// Literals cannot head pipeline stages past the first one.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::Nil(_) | Expr::Bool(_) | Expr::Number(_) | Expr::Str(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NilLit {
    pub pos: Pos,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoolLit {
    pub pos: Pos,
    pub line: u32,
    pub value: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum NumberValue {
    Int(i64),
    Uint(u64),
    Float(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberLit {
    pub pos: Pos,
    pub line: u32,
    /// Source text, reproduced verbatim by the printer.
    pub raw: SmolStr,
    pub value: NumberValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrLit {
    pub pos: Pos,
    pub line: u32,
    /// Source text with its quotes, reproduced verbatim by the printer.
    pub raw: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentExpr {
    pub pos: Pos,
    pub line: u32,
    pub name: SmolStr,
}

/// `.a.b.c` — a field chain rooted at the implicit context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldExpr {
    pub pos: Pos,
    pub line: u32,
    pub idents: Vec<SmolStr>,
}

/// `base.a.b` — a field chain rooted at an arbitrary expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExpr {
    pub pos: Pos,
    pub line: u32,
    pub base: Expr,
    pub fields: Vec<SmolStr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnaryExpr {
    pub pos: Pos,
    pub line: u32,
    pub op: UnaryOp,
    pub expr: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotExpr {
    pub pos: Pos,
    pub line: u32,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            Eq => "==",
            NotEq => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            And => "&&",
            Or => "||",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryExpr {
    pub pos: Pos,
    pub line: u32,
    pub op: BinaryOp,
    pub left: Expr,
    pub right: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TernaryExpr {
    pub pos: Pos,
    pub line: u32,
    pub cond: Expr,
    pub left: Expr,
    pub right: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallExpr {
    pub pos: Pos,
    pub line: u32,
    pub base: Expr,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexExpr {
    pub pos: Pos,
    pub line: u32,
    pub base: Expr,
    pub index: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceExpr {
    pub pos: Pos,
    pub line: u32,
    pub base: Expr,
    pub start: Option<Expr>,
    pub end: Option<Expr>,
}

/// `isset(expr)` — recognised at parse time so that probing expressions
/// which would otherwise fail resolves to a boolean instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssetExpr {
    pub pos: Pos,
    pub line: u32,
    pub arg: Expr,
}

// ---------------------------------------------------------------------------
// Printing back to source. The printed form of a parsed template re-parses
// to an equivalent tree; the Set relies on this for dumping cached trees.

impl fmt::Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

fn write_set(f: &mut fmt::Formatter<'_>, set: &SetClause) -> fmt::Result {
    for (i, left) in set.left.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{left}")?;
    }
    write!(f, " {} ", if set.decl { ":=" } else { "=" })?;
    for (i, right) in set.right.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{right}")?;
    }
    Ok(())
}

fn write_block_params(f: &mut fmt::Formatter<'_>, params: &BlockParams) -> fmt::Result {
    write!(f, "(")?;
    for (i, param) in params.list.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", param.name)?;
        if let Some(default) = &param.default {
            write!(f, "={default}")?;
        }
    }
    write!(f, ")")
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Text(n) => write!(f, "{}", n.text),
            Stmt::Action(n) => {
                write!(f, "{{{{")?;
                if let Some(set) = &n.set {
                    write_set(f, set)?;
                    if n.pipe.is_some() {
                        write!(f, "; ")?;
                    }
                }
                if let Some(pipe) = &n.pipe {
                    write!(f, "{pipe}")?;
                }
                write!(f, "}}}}")
            }
            Stmt::If(n) => {
                write!(f, "{{{{if ")?;
                if let Some(set) = &n.set {
                    write_set(f, set)?;
                    write!(f, "; ")?;
                }
                write!(f, "{}}}}}{}", n.cond, n.then_list)?;
                if let Some(else_list) = &n.else_list {
                    write!(f, "{{{{else}}}}{else_list}")?;
                }
                write!(f, "{{{{end}}}}")
            }
            Stmt::Range(n) => {
                write!(f, "{{{{range ")?;
                if let Some(set) = &n.set {
                    write_set(f, set)?;
                } else if let Some(expr) = &n.expr {
                    write!(f, "{expr}")?;
                }
                write!(f, "}}}}{}", n.body)?;
                if let Some(else_list) = &n.else_list {
                    write!(f, "{{{{else}}}}{else_list}")?;
                }
                write!(f, "{{{{end}}}}")
            }
            Stmt::Block(n) => {
                write!(f, "{{{{block {}", n.name)?;
                write_block_params(f, &n.params)?;
                if let Some(context) = &n.context {
                    write!(f, " {context}")?;
                }
                write!(f, "}}}}{}", n.body)?;
                if let Some(content) = &n.content {
                    write!(f, "{{{{content}}}}{content}")?;
                }
                write!(f, "{{{{end}}}}")
            }
            Stmt::Yield(n) => match &n.kind {
                YieldKind::Content { context } => {
                    write!(f, "{{{{yield content")?;
                    if let Some(context) = context {
                        write!(f, " {context}")?;
                    }
                    write!(f, "}}}}")
                }
                YieldKind::Block { name, args, context, content } => {
                    write!(f, "{{{{yield {name}(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        if let Some(name) = &arg.name {
                            write!(f, "{name}=")?;
                        }
                        write!(f, "{}", arg.value)?;
                    }
                    write!(f, ")")?;
                    if let Some(context) = context {
                        write!(f, " {context}")?;
                    }
                    if let Some(content) = content {
                        write!(f, " content}}}}{content}{{{{end}}}}")
                    } else {
                        write!(f, "}}}}")
                    }
                }
            },
            Stmt::Include(n) => {
                write!(f, "{{{{include {}", n.name)?;
                if let Some(context) = &n.context {
                    write!(f, " {context}")?;
                }
                write!(f, "}}}}")
            }
            Stmt::Return(n) => {
                write!(f, "{{{{return")?;
                if let Some(value) = &n.value {
                    write!(f, " {value}")?;
                }
                write!(f, "}}}}")
            }
            Stmt::Try(n) => {
                write!(f, "{{{{try}}}}{}", n.body)?;
                if let Some(catch_body) = &n.catch_body {
                    write!(f, "{{{{catch")?;
                    if let Some(ident) = &n.catch_ident {
                        write!(f, " {ident}")?;
                    }
                    write!(f, "}}}}{catch_body}")?;
                }
                write!(f, "{{{{end}}}}")
            }
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cmd) in self.cmds.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{cmd}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        if self.call {
            write!(f, ": ")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Nil(_) => write!(f, "nil"),
            Expr::Bool(n) => write!(f, "{}", n.value),
            Expr::Number(n) => write!(f, "{}", n.raw),
            Expr::Str(n) => write!(f, "{}", n.raw),
            Expr::Ident(n) => write!(f, "{}", n.name),
            Expr::Field(n) => {
                for ident in &n.idents {
                    write!(f, ".{ident}")?;
                }
                Ok(())
            }
            Expr::Chain(n) => {
                write!(f, "{}", n.base)?;
                for field in &n.fields {
                    write!(f, ".{field}")?;
                }
                Ok(())
            }
            Expr::Unary(n) => {
                let sign = if n.op == UnaryOp::Neg { "-" } else { "+" };
                write!(f, "{sign}{}", n.expr)
            }
            Expr::Not(n) => write!(f, "!{}", n.expr),
            Expr::Binary(n) => write!(f, "({} {} {})", n.left, n.op.as_str(), n.right),
            Expr::Ternary(n) => write!(f, "({} ? {} : {})", n.cond, n.left, n.right),
            Expr::Call(n) => {
                write!(f, "{}(", n.base)?;
                for (i, arg) in n.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Index(n) => write!(f, "{}[{}]", n.base, n.index),
            Expr::Slice(n) => {
                write!(f, "{}[", n.base)?;
                if let Some(start) = &n.start {
                    write!(f, "{start}")?;
                }
                write!(f, ":")?;
                if let Some(end) = &n.end {
                    write!(f, "{end}")?;
                }
                write!(f, "]")
            }
            Expr::Isset(n) => write!(f, "isset({})", n.arg),
        }
    }
}
