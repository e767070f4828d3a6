use crate::ast::*;
use crate::diagnostics::{QuillError, QuillResult};
use crate::lexer::Lexer;
use crate::position::Pos;
use crate::runtime::BlockMap;
use crate::set::{ParseState, ParsedTemplate, Set, Template};
use crate::tokens::{Keyword, Symbol, Token, TokenKind};
use smol_str::SmolStr;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) fn parse_template(
    set: &Set,
    name: &str,
    source: &str,
    state: &mut ParseState,
) -> QuillResult<ParsedTemplate> {
    let eof = Token::new(TokenKind::Eof, Pos(0), 0);
    let mut parser = Parser {
        set,
        state,
        name: name.to_string(),
        lexer: Lexer::new(name, source, set.lexer_options()),
        token: [eof.clone(), eof.clone(), eof],
        peek_count: 0,
        extends: None,
        imports: Vec::new(),
        passed_blocks: HashMap::new(),
    };
    let root = parser.parse()?;
    Ok(ParsedTemplate {
        root,
        extends: parser.extends,
        imports: parser.imports,
        passed_blocks: parser.passed_blocks,
    })
}

/// What closed an item list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    End,
    Else,
    Content,
    Catch(Option<SmolStr>),
}

impl Term {
    fn matches(&self, other: &Term) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

struct Parser<'s, 'p> {
    set: &'s Set,
    state: &'p mut ParseState,
    name: String,
    lexer: Lexer<'s>,
    /// Three-token ring buffer for lookahead, consumed newest-first.
    token: [Token; 3],
    peek_count: usize,
    extends: Option<Arc<Template>>,
    imports: Vec<Arc<Template>>,
    passed_blocks: BlockMap,
}

impl<'s, 'p> Parser<'s, 'p> {
    // ------------------------------------------------------------------
    // Token plumbing

    fn next(&mut self) -> QuillResult<Token> {
        if self.peek_count > 0 {
            self.peek_count -= 1;
        } else {
            self.token[0] = self.lexer.next_token()?;
        }
        Ok(self.token[self.peek_count].clone())
    }

    fn backup(&mut self) {
        self.peek_count += 1;
    }

    /// Push back two tokens; the most recently consumed one is already in
    /// slot zero.
    fn backup2(&mut self, t1: Token) {
        self.token[1] = t1;
        self.peek_count = 2;
    }

    fn peek(&mut self) -> QuillResult<Token> {
        if self.peek_count > 0 {
            return Ok(self.token[self.peek_count - 1].clone());
        }
        self.peek_count = 1;
        self.token[0] = self.lexer.next_token()?;
        Ok(self.token[0].clone())
    }

    fn eat_symbol(&mut self, symbol: Symbol) -> QuillResult<bool> {
        if self.peek()?.is_symbol(symbol) {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn expect_symbol(&mut self, symbol: Symbol, context: &str) -> QuillResult<Token> {
        let token = self.next()?;
        if !token.is_symbol(symbol) {
            return Err(self.unexpected(&token, context));
        }
        Ok(token)
    }

    fn expect_right_delim(&mut self, context: &str) -> QuillResult<Token> {
        let token = self.next()?;
        if !matches!(token.kind, TokenKind::RightDelim) {
            return Err(self.unexpected(&token, context));
        }
        Ok(token)
    }

    fn expect_ident(&mut self, context: &str) -> QuillResult<(SmolStr, Token)> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::Identifier(name) => Ok((name.clone(), token.clone())),
            _ => Err(self.unexpected(&token, context)),
        }
    }

    /// A quoted or raw string literal; returns the decoded value.
    fn expect_string(&mut self, context: &str) -> QuillResult<String> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::Str(value) | TokenKind::RawStr(value) => Ok(value.clone()),
            _ => Err(self.unexpected(&token, context)),
        }
    }

    fn error_at(&self, token: &Token, message: impl Into<String>) -> QuillError {
        QuillError::parse(&self.name, token.line, message)
    }

    fn error_here(&mut self, message: impl Into<String>) -> QuillError {
        QuillError::parse(&self.name, self.lexer.line(), message)
    }

    fn unexpected(&self, token: &Token, context: &str) -> QuillError {
        self.error_at(token, format!("unexpected {token} in {context}"))
    }

    // ------------------------------------------------------------------
    // Top level: preamble then body

    fn parse(&mut self) -> QuillResult<List> {
        let mut root = List::new(Pos(0));
        self.parse_preamble()?;

        loop {
            let token = self.peek()?;
            if token.is_eof() {
                break;
            }
            let stmt = self.text_or_action()?;
            root.append(stmt);
        }
        Ok(root)
    }

    /// `extends`/`import` directives are only valid before any other
    /// content; whitespace-only text is allowed between them.
    fn parse_preamble(&mut self) -> QuillResult<()> {
        loop {
            let token = self.peek()?;
            match &token.kind {
                TokenKind::Text(text) if text.trim().is_empty() => {
                    self.next()?;
                }
                TokenKind::LeftDelim => {
                    let delim = self.next()?;
                    let inner = self.next()?;
                    match inner.kind {
                        TokenKind::Keyword(Keyword::Extends) => {
                            if self.extends.is_some() {
                                return Err(self.error_at(
                                    &inner,
                                    "unexpected extends clause, only one extends clause is valid per template",
                                ));
                            }
                            if !self.imports.is_empty() {
                                return Err(self.error_at(
                                    &inner,
                                    "unexpected extends clause, all import clauses must come after the extends clause",
                                ));
                            }
                            let path = self.expect_string("extends clause")?;
                            let parent = self.load_composed(&path, &inner)?;
                            self.extends = Some(parent);
                            self.expect_right_delim("extends clause")?;
                        }
                        TokenKind::Keyword(Keyword::Import) => {
                            let path = self.expect_string("import clause")?;
                            let imported = self.load_composed(&path, &inner)?;
                            self.imports.push(imported);
                            self.expect_right_delim("import clause")?;
                        }
                        _ => {
                            self.backup2(delim);
                            return Ok(());
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn load_composed(&mut self, path: &str, at: &Token) -> QuillResult<Arc<Template>> {
        self.set
            .load_for_parse(path, &self.name, &mut *self.state)
            .map_err(|err| self.error_at(at, err.to_string()))
    }

    // ------------------------------------------------------------------
    // Statements

    /// Parse one text or action node. Top-level terminators (`end`,
    /// `else`, `content`, `catch`) are errors here.
    fn text_or_action(&mut self) -> QuillResult<Stmt> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Text(text) => Ok(Stmt::Text(TextStmt {
                pos: token.pos,
                line: token.line,
                text,
            })),
            TokenKind::LeftDelim => self.action(&token),
            _ => Err(self.unexpected(&token, "input")),
        }
    }

    /// The left delimiter has been consumed; dispatch on the first token
    /// inside the action.
    fn action(&mut self, delim: &Token) -> QuillResult<Stmt> {
        let token = self.peek()?;
        match token.kind {
            TokenKind::Keyword(Keyword::If) => {
                self.next()?;
                return self.if_control(&token);
            }
            TokenKind::Keyword(Keyword::Range) => {
                self.next()?;
                return self.range_control(&token);
            }
            TokenKind::Keyword(Keyword::Block) => {
                self.next()?;
                return self.parse_block(&token);
            }
            TokenKind::Keyword(Keyword::Yield) => {
                self.next()?;
                return self.parse_yield(&token);
            }
            TokenKind::Keyword(Keyword::Include) => {
                self.next()?;
                return self.parse_include(&token);
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.next()?;
                return self.parse_return(&token);
            }
            TokenKind::Keyword(Keyword::Try) => {
                self.next()?;
                return self.parse_try(&token);
            }
            TokenKind::Keyword(Keyword::Extends) => {
                return Err(self.error_at(
                    &token,
                    "unexpected extends clause: extends is only valid at the start of a template",
                ));
            }
            TokenKind::Keyword(Keyword::Import) => {
                return Err(self.error_at(
                    &token,
                    "unexpected import clause: imports are only valid in the template preamble",
                ));
            }
            TokenKind::Keyword(Keyword::End) => {
                return Err(self.error_at(&token, "unexpected {{end}}"));
            }
            TokenKind::Keyword(Keyword::Else) => {
                return Err(self.error_at(&token, "unexpected {{else}}"));
            }
            TokenKind::Keyword(Keyword::Content) => {
                return Err(self.error_at(&token, "unexpected {{content}} outside of a block"));
            }
            TokenKind::Keyword(Keyword::Catch) => {
                return Err(self.error_at(&token, "unexpected {{catch}} outside of a try"));
            }
            TokenKind::Keyword(Keyword::New) => {
                return Err(self.error_at(&token, "new is a reserved word"));
            }
            _ => {}
        }
        self.action_stmt(delim)
    }

    /// `{{ [set] [; pipeline] }}` or `{{ pipeline }}`.
    fn action_stmt(&mut self, delim: &Token) -> QuillResult<Stmt> {
        let line = delim.line;
        let pos = delim.pos;
        match self.assignment_or_expression("command")? {
            SetOrExpr::Set(set) => {
                let token = self.next()?;
                let pipe = match token.kind {
                    TokenKind::Symbol(Symbol::Semicolon) => {
                        let pipe = self.parse_pipeline("command", None)?;
                        self.expect_right_delim("command")?;
                        Some(pipe)
                    }
                    TokenKind::RightDelim => None,
                    _ => return Err(self.unexpected(&token, "command")),
                };
                Ok(Stmt::Action(Box::new(ActionStmt {
                    pos,
                    line,
                    set: Some(set),
                    pipe,
                })))
            }
            SetOrExpr::Expr(first) => {
                let pipe = self.parse_pipeline("command", Some(first))?;
                self.expect_right_delim("command")?;
                Ok(Stmt::Action(Box::new(ActionStmt {
                    pos,
                    line,
                    set: None,
                    pipe: Some(pipe),
                })))
            }
        }
    }

    fn if_control(&mut self, at: &Token) -> QuillResult<Stmt> {
        let (set, cond, then_list, else_list) = self.parse_control(true, "if")?;
        let cond = cond.ok_or_else(|| self.error_at(at, "missing condition in if"))?;
        Ok(Stmt::If(Box::new(IfStmt {
            pos: at.pos,
            line: at.line,
            set,
            cond,
            then_list,
            else_list,
        })))
    }

    fn range_control(&mut self, at: &Token) -> QuillResult<Stmt> {
        let (set, expr, body, else_list) = self.parse_control(false, "range")?;
        if set.is_none() && expr.is_none() {
            return Err(self.error_at(at, "missing producer in range"));
        }
        Ok(Stmt::Range(Box::new(RangeStmt {
            pos: at.pos,
            line: at.line,
            set,
            expr,
            body,
            else_list,
        })))
    }

    #[allow(clippy::type_complexity)]
    fn parse_control(
        &mut self,
        allow_else_if: bool,
        context: &'static str,
    ) -> QuillResult<(Option<SetClause>, Option<Expr>, List, Option<List>)> {
        let (set, expr) = match self.assignment_or_expression(context)? {
            SetOrExpr::Set(set) => {
                if context == "range" {
                    (Some(set), None)
                } else {
                    // `if v := e; cond`
                    self.expect_symbol(Symbol::Semicolon, context)?;
                    let cond = self.parse_expression(context)?;
                    (Some(set), Some(cond))
                }
            }
            SetOrExpr::Expr(expr) => (None, Some(expr)),
        };
        self.expect_right_delim(context)?;

        let (list, term) = self.item_list(context, &[Term::End, Term::Else])?;
        let else_list = match term {
            Term::End => None,
            Term::Else => {
                // `{{else if ...}}` leaves the `if` token pending and
                // shares the single closing `{{end}}`.
                if allow_else_if && self.peek()?.is_keyword(Keyword::If) {
                    let token = self.next()?;
                    let mut else_list = List::new(token.pos);
                    else_list.append(self.if_control(&token)?);
                    Some(else_list)
                } else {
                    let (else_list, term) = self.item_list(context, &[Term::End])?;
                    debug_assert!(term.matches(&Term::End));
                    Some(else_list)
                }
            }
            _ => unreachable!("item_list only returns requested terminators"),
        };
        Ok((set, expr, list, else_list))
    }

    /// Parse statements until one of `allowed` closes the list.
    fn item_list(&mut self, context: &str, allowed: &[Term]) -> QuillResult<(List, Term)> {
        let mut list = List::new(self.peek()?.pos);
        loop {
            let token = self.peek()?;
            if token.is_eof() {
                return Err(self.error_here(format!("unexpected EOF in {context}")));
            }
            if matches!(token.kind, TokenKind::LeftDelim) {
                let delim = self.next()?;
                let inner = self.next()?;
                match &inner.kind {
                    TokenKind::Keyword(Keyword::End) => {
                        self.expect_right_delim("end")?;
                        if !allowed.iter().any(|t| t.matches(&Term::End)) {
                            return Err(self.error_at(&inner, "unexpected {{end}}"));
                        }
                        return Ok((list, Term::End));
                    }
                    TokenKind::Keyword(Keyword::Else) => {
                        if !allowed.iter().any(|t| t.matches(&Term::Else)) {
                            return Err(self.error_at(&inner, "unexpected {{else}}"));
                        }
                        // `else if` keeps the `if` pending for the caller
                        if !self.peek()?.is_keyword(Keyword::If) {
                            self.expect_right_delim("else")?;
                        }
                        return Ok((list, Term::Else));
                    }
                    TokenKind::Keyword(Keyword::Content) => {
                        let next = self.peek()?;
                        if matches!(next.kind, TokenKind::RightDelim)
                            && allowed.iter().any(|t| t.matches(&Term::Content))
                        {
                            self.next()?;
                            return Ok((list, Term::Content));
                        }
                        return Err(self.error_at(&inner, "unexpected {{content}}"));
                    }
                    TokenKind::Keyword(Keyword::Catch) => {
                        if !allowed.iter().any(|t| t.matches(&Term::Catch(None))) {
                            return Err(
                                self.error_at(&inner, "unexpected {{catch}} outside of a try")
                            );
                        }
                        let token = self.next()?;
                        let ident = match &token.kind {
                            TokenKind::Identifier(name) => {
                                self.expect_right_delim("catch")?;
                                Some(name.clone())
                            }
                            TokenKind::RightDelim => None,
                            _ => return Err(self.unexpected(&token, "catch")),
                        };
                        return Ok((list, Term::Catch(ident)));
                    }
                    _ => {
                        self.backup2(delim);
                        let stmt = self.text_or_action()?;
                        list.append(stmt);
                    }
                }
            } else {
                let stmt = self.text_or_action()?;
                list.append(stmt);
            }
        }
    }

    fn parse_block(&mut self, at: &Token) -> QuillResult<Stmt> {
        let token = self.next()?;
        let name = match &token.kind {
            TokenKind::Identifier(name) => name.clone(),
            TokenKind::Keyword(kw) => {
                return Err(self.error_at(
                    &token,
                    format!("unexpected reserved word {kw} as block name"),
                ))
            }
            _ => return Err(self.unexpected(&token, "block clause")),
        };

        let params = if self.peek()?.is_symbol(Symbol::LParen) {
            self.next()?;
            self.parse_block_param_defs()?
        } else {
            BlockParams::default()
        };

        let context = if matches!(self.peek()?.kind, TokenKind::RightDelim) {
            None
        } else {
            Some(self.parse_expression("block")?)
        };
        self.expect_right_delim("block clause")?;

        let (body, term) = self.item_list("block", &[Term::End, Term::Content])?;
        let content = if term.matches(&Term::Content) {
            let (content, term) = self.item_list("block content", &[Term::End])?;
            debug_assert!(term.matches(&Term::End));
            Some(Arc::new(content))
        } else {
            None
        };

        let block = Arc::new(BlockStmt {
            pos: at.pos,
            line: at.line,
            name: name.clone(),
            params,
            context,
            body: Arc::new(body),
            content,
        });
        self.passed_blocks.insert(name, Arc::clone(&block));
        Ok(Stmt::Block(block))
    }

    /// `(name, name=default, ...)` — the left paren has been consumed.
    fn parse_block_param_defs(&mut self) -> QuillResult<BlockParams> {
        let mut params = BlockParams::default();
        if self.eat_symbol(Symbol::RParen)? {
            return Ok(params);
        }
        loop {
            let (name, _) = self.expect_ident("block parameter list")?;
            let default = if self.eat_symbol(Symbol::Assign)? {
                Some(self.parse_expression("block parameter default")?)
            } else {
                None
            };
            params.list.push(BlockParam { name, default });
            if !self.eat_symbol(Symbol::Comma)? {
                break;
            }
        }
        self.expect_symbol(Symbol::RParen, "block parameter list")?;
        Ok(params)
    }

    fn parse_yield(&mut self, at: &Token) -> QuillResult<Stmt> {
        let token = self.next()?;
        if token.is_keyword(Keyword::Content) {
            let context = if matches!(self.peek()?.kind, TokenKind::RightDelim) {
                None
            } else {
                Some(self.parse_expression("yield content")?)
            };
            self.expect_right_delim("yield content")?;
            return Ok(Stmt::Yield(Box::new(YieldStmt {
                pos: at.pos,
                line: at.line,
                kind: YieldKind::Content { context },
            })));
        }

        let name = match &token.kind {
            TokenKind::Identifier(name) => name.clone(),
            _ => return Err(self.unexpected(&token, "yield clause")),
        };

        let args = if self.peek()?.is_symbol(Symbol::LParen) {
            self.next()?;
            self.parse_yield_args()?
        } else {
            Vec::new()
        };

        let mut context = None;
        let mut content = None;
        let token = self.peek()?;
        match token.kind {
            TokenKind::RightDelim => {
                self.next()?;
            }
            TokenKind::Keyword(Keyword::Content) => {
                self.next()?;
                self.expect_right_delim("yield clause")?;
                let (body, _) = self.item_list("yield content", &[Term::End])?;
                content = Some(Arc::new(body));
            }
            _ => {
                context = Some(self.parse_expression("yield")?);
                let token = self.next()?;
                match token.kind {
                    TokenKind::RightDelim => {}
                    TokenKind::Keyword(Keyword::Content) => {
                        self.expect_right_delim("yield clause")?;
                        let (body, _) = self.item_list("yield content", &[Term::End])?;
                        content = Some(Arc::new(body));
                    }
                    _ => return Err(self.unexpected(&token, "yield clause")),
                }
            }
        }

        Ok(Stmt::Yield(Box::new(YieldStmt {
            pos: at.pos,
            line: at.line,
            kind: YieldKind::Block { name, args, context, content },
        })))
    }

    /// `(expr, name=expr, ...)` — the left paren has been consumed.
    /// Positional arguments bind to parameters in order; keyword ones by
    /// name.
    fn parse_yield_args(&mut self) -> QuillResult<Vec<YieldArg>> {
        let mut args = Vec::new();
        if self.eat_symbol(Symbol::RParen)? {
            return Ok(args);
        }
        loop {
            let token = self.next()?;
            let arg = match &token.kind {
                TokenKind::Identifier(name) => {
                    let after = self.next()?;
                    if after.is_symbol(Symbol::Assign) {
                        let value = self.parse_expression("yield argument")?;
                        YieldArg { name: Some(name.clone()), value }
                    } else {
                        self.backup2(token.clone());
                        let value = self.parse_expression("yield argument")?;
                        YieldArg { name: None, value }
                    }
                }
                _ => {
                    self.backup();
                    let value = self.parse_expression("yield argument")?;
                    YieldArg { name: None, value }
                }
            };
            args.push(arg);
            if !self.eat_symbol(Symbol::Comma)? {
                break;
            }
        }
        self.expect_symbol(Symbol::RParen, "yield argument list")?;
        Ok(args)
    }

    fn parse_include(&mut self, at: &Token) -> QuillResult<Stmt> {
        // string literal or an expression resolving to a name at render
        // time; both are ordinary expressions here
        let name = self.parse_expression("include")?;
        let context = if matches!(self.peek()?.kind, TokenKind::RightDelim) {
            None
        } else {
            Some(self.parse_expression("include")?)
        };
        self.expect_right_delim("include")?;
        Ok(Stmt::Include(Box::new(IncludeStmt {
            pos: at.pos,
            line: at.line,
            name,
            context,
        })))
    }

    fn parse_return(&mut self, at: &Token) -> QuillResult<Stmt> {
        let value = if matches!(self.peek()?.kind, TokenKind::RightDelim) {
            None
        } else {
            Some(self.parse_expression("return")?)
        };
        self.expect_right_delim("return")?;
        Ok(Stmt::Return(Box::new(ReturnStmt {
            pos: at.pos,
            line: at.line,
            value,
        })))
    }

    fn parse_try(&mut self, at: &Token) -> QuillResult<Stmt> {
        self.expect_right_delim("try")?;
        let (body, term) = self.item_list("try", &[Term::End, Term::Catch(None)])?;
        let (catch_ident, catch_body) = match term {
            Term::Catch(ident) => {
                let (catch_body, _) = self.item_list("catch", &[Term::End])?;
                (ident, Some(catch_body))
            }
            _ => (None, None),
        };
        Ok(Stmt::Try(Box::new(TryStmt {
            pos: at.pos,
            line: at.line,
            body,
            catch_ident,
            catch_body,
        })))
    }

    // ------------------------------------------------------------------
    // Assignments and pipelines

    fn assignment_or_expression(&mut self, context: &'static str) -> QuillResult<SetOrExpr> {
        let first = self.parse_expression(context)?;
        let token = self.next()?;
        let pos = first.pos();
        let line = first.line();

        let mut left = vec![first];
        let mut tok = token;
        loop {
            match tok.kind {
                TokenKind::Symbol(Symbol::Comma) => {
                    left.push(self.parse_expression(context)?);
                    tok = self.next()?;
                }
                TokenKind::Symbol(Symbol::Assign) | TokenKind::Symbol(Symbol::Declare) => break,
                _ => {
                    if left.len() > 1 {
                        return Err(self.unexpected(&tok, "assignment"));
                    }
                    self.backup();
                    return Ok(SetOrExpr::Expr(left.pop().expect("one expression parsed")));
                }
            }
        }
        let decl = tok.is_symbol(Symbol::Declare);

        for target in &left {
            match target {
                Expr::Ident(_) => {}
                other if decl => {
                    return Err(self.error_at(
                        &tok,
                        format!("unexpected {other} in variable declaration"),
                    ))
                }
                _ => {
                    return Err(self
                        .error_at(&tok, "assignment target must be an identifier"))
                }
            }
        }

        let mut right = Vec::new();
        loop {
            right.push(self.parse_expression("assignment")?);
            if !self.eat_symbol(Symbol::Comma)? {
                break;
            }
        }

        let mut index_lookup = false;
        if context == "range" {
            if left.len() > 2 || right.len() != 1 {
                return Err(
                    self.error_at(&tok, "unexpected number of operands in range assignment")
                );
            }
        } else if left.len() == 2 && right.len() == 1 {
            // `v, ok := m[key]` and friends: the single value plus a
            // presence flag
            index_lookup = true;
        } else if left.len() != right.len() {
            return Err(self.error_at(&tok, "unexpected number of operands in assignment"));
        }

        Ok(SetOrExpr::Set(SetClause {
            pos,
            line,
            decl,
            index_lookup,
            left,
            right,
        }))
    }

    /// `cmd ('|' cmd)*` where each command is `expr [: args]`. The first
    /// command's base may have been parsed already by the caller.
    fn parse_pipeline(
        &mut self,
        context: &'static str,
        first: Option<Expr>,
    ) -> QuillResult<Pipeline> {
        let mut base = match first {
            Some(expr) => expr,
            None => self.parse_expression(context)?,
        };
        let pos = base.pos();
        let line = base.line();
        let mut cmds = Vec::new();

        loop {
            let mut cmd = Command {
                pos: base.pos(),
                line: base.line(),
                base,
                call: false,
                args: Vec::new(),
            };
            if self.eat_symbol(Symbol::Colon)? {
                cmd.call = true;
                loop {
                    cmd.args.push(self.parse_expression("call expression")?);
                    if !self.eat_symbol(Symbol::Comma)? {
                        break;
                    }
                }
            }
            cmds.push(cmd);
            if self.eat_symbol(Symbol::Pipe)? {
                base = self.parse_expression(context)?;
            } else {
                break;
            }
        }

        // only the first stage may start from a bare literal
        for (i, cmd) in cmds.iter().enumerate().skip(1) {
            if cmd.base.is_literal() {
                return Err(self.error_at(
                    &Token::new(TokenKind::Eof, cmd.pos, cmd.line),
                    format!("non executable command in pipeline stage {}", i + 1),
                ));
            }
        }

        Ok(Pipeline { pos, line, cmds })
    }

    // ------------------------------------------------------------------
    // Expressions, one method per precedence level

    fn parse_expression(&mut self, context: &'static str) -> QuillResult<Expr> {
        let expr = self.parse_logical(context)?;
        if self.eat_symbol(Symbol::Question)? {
            let left = self.parse_expression(context)?;
            self.expect_symbol(Symbol::Colon, "ternary expression")?;
            let right = self.parse_expression(context)?;
            return Ok(Expr::Ternary(Box::new(TernaryExpr {
                pos: expr.pos(),
                line: expr.line(),
                cond: expr,
                left,
                right,
            })));
        }
        Ok(expr)
    }

    fn parse_logical(&mut self, context: &'static str) -> QuillResult<Expr> {
        let mut left = self.parse_comparative(context)?;
        loop {
            let token = self.peek()?;
            let op = match token.kind {
                TokenKind::Symbol(Symbol::AndAnd) => BinaryOp::And,
                TokenKind::Symbol(Symbol::OrOr) => BinaryOp::Or,
                _ => break,
            };
            self.next()?;
            let right = self.parse_comparative(context)?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparative(&mut self, context: &'static str) -> QuillResult<Expr> {
        let mut left = self.parse_numeric_comparative(context)?;
        loop {
            let token = self.peek()?;
            let op = match token.kind {
                TokenKind::Symbol(Symbol::EqEq) => BinaryOp::Eq,
                TokenKind::Symbol(Symbol::NotEq) => BinaryOp::NotEq,
                _ => break,
            };
            self.next()?;
            let right = self.parse_numeric_comparative(context)?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_numeric_comparative(&mut self, context: &'static str) -> QuillResult<Expr> {
        let mut left = self.parse_additive(context)?;
        loop {
            let token = self.peek()?;
            let op = match token.kind {
                TokenKind::Symbol(Symbol::Lt) => BinaryOp::Lt,
                TokenKind::Symbol(Symbol::Le) => BinaryOp::Le,
                TokenKind::Symbol(Symbol::Gt) => BinaryOp::Gt,
                TokenKind::Symbol(Symbol::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.next()?;
            let right = self.parse_additive(context)?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self, context: &'static str) -> QuillResult<Expr> {
        let mut left = self.parse_multiplicative(context)?;
        loop {
            let token = self.peek()?;
            let op = match token.kind {
                TokenKind::Symbol(Symbol::Plus) => BinaryOp::Add,
                TokenKind::Symbol(Symbol::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.next()?;
            let right = self.parse_multiplicative(context)?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self, context: &'static str) -> QuillResult<Expr> {
        let mut left = self.parse_unary(context)?;
        loop {
            let token = self.peek()?;
            let op = match token.kind {
                TokenKind::Symbol(Symbol::Star) => BinaryOp::Mul,
                TokenKind::Symbol(Symbol::Slash) => BinaryOp::Div,
                TokenKind::Symbol(Symbol::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.next()?;
            let right = self.parse_unary(context)?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self, context: &'static str) -> QuillResult<Expr> {
        let token = self.peek()?;
        match token.kind {
            TokenKind::Symbol(Symbol::Not) => {
                self.next()?;
                let expr = self.parse_comparative(context)?;
                return Ok(Expr::Not(Box::new(NotExpr {
                    pos: token.pos,
                    line: token.line,
                    expr,
                })));
            }
            TokenKind::Symbol(Symbol::Minus) | TokenKind::Symbol(Symbol::Plus) => {
                // a sign is consumed only when an operand follows
                let sign = self.next()?;
                let next = self.peek()?;
                let consumes = matches!(
                    next.kind,
                    TokenKind::Number(_)
                        | TokenKind::Identifier(_)
                        | TokenKind::Field(_)
                        | TokenKind::Symbol(Symbol::LParen)
                );
                if consumes {
                    let expr = self.parse_operand(context)?;
                    let op = if sign.is_symbol(Symbol::Minus) {
                        UnaryOp::Neg
                    } else {
                        UnaryOp::Pos
                    };
                    return Ok(Expr::Unary(Box::new(UnaryExpr {
                        pos: sign.pos,
                        line: sign.line,
                        op,
                        expr,
                    })));
                }
                return Err(self.unexpected(&next, context));
            }
            _ => {}
        }
        self.parse_operand(context)
    }

    /// term, followed by any mix of field accesses, calls and
    /// index/slice suffixes.
    fn parse_operand(&mut self, context: &'static str) -> QuillResult<Expr> {
        let mut node = self.parse_term(context)?;
        loop {
            if matches!(self.peek()?.kind, TokenKind::Field(_)) {
                let mut fields = Vec::new();
                while let TokenKind::Field(_) = self.peek()?.kind {
                    let token = self.next()?;
                    if let TokenKind::Field(name) = token.kind {
                        fields.push(name);
                    }
                }
                node = match node {
                    Expr::Field(mut field) => {
                        field.idents.extend(fields);
                        Expr::Field(field)
                    }
                    literal @ (Expr::Nil(_)
                    | Expr::Bool(_)
                    | Expr::Number(_)
                    | Expr::Str(_)) => {
                        return Err(self.error_here(format!(
                            "unexpected . after term {literal}"
                        )));
                    }
                    base => Expr::Chain(Box::new(ChainExpr {
                        pos: base.pos(),
                        line: base.line(),
                        base,
                        fields,
                    })),
                };
            }
            if self.eat_symbol(Symbol::LParen)? {
                let args = self.parse_call_args()?;
                self.expect_symbol(Symbol::RParen, "call expression")?;
                node = Expr::Call(Box::new(CallExpr {
                    pos: node.pos(),
                    line: node.line(),
                    base: node,
                    args,
                }));
                continue;
            }
            if self.eat_symbol(Symbol::LBracket)? {
                node = self.parse_index_or_slice(node)?;
                continue;
            }
            break;
        }
        Ok(node)
    }

    fn parse_index_or_slice(&mut self, base: Expr) -> QuillResult<Expr> {
        let pos = base.pos();
        let line = base.line();
        if self.eat_symbol(Symbol::Colon)? {
            let end = if self.peek()?.is_symbol(Symbol::RBracket) {
                None
            } else {
                Some(self.parse_expression("slice expression")?)
            };
            self.expect_symbol(Symbol::RBracket, "slice expression")?;
            return Ok(Expr::Slice(Box::new(SliceExpr {
                pos,
                line,
                base,
                start: None,
                end,
            })));
        }
        let first = self.parse_expression("index expression")?;
        if self.eat_symbol(Symbol::Colon)? {
            let end = if self.peek()?.is_symbol(Symbol::RBracket) {
                None
            } else {
                Some(self.parse_expression("slice expression")?)
            };
            self.expect_symbol(Symbol::RBracket, "slice expression")?;
            return Ok(Expr::Slice(Box::new(SliceExpr {
                pos,
                line,
                base,
                start: Some(first),
                end,
            })));
        }
        self.expect_symbol(Symbol::RBracket, "index expression")?;
        Ok(Expr::Index(Box::new(IndexExpr {
            pos,
            line,
            base,
            index: first,
        })))
    }

    fn parse_call_args(&mut self) -> QuillResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek()?.is_symbol(Symbol::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression("call expression")?);
            if !self.eat_symbol(Symbol::Comma)? {
                break;
            }
        }
        Ok(args)
    }

    fn parse_term(&mut self, context: &'static str) -> QuillResult<Expr> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::Identifier(name) if name == "isset" => {
                if self.peek()?.is_symbol(Symbol::LParen) {
                    self.next()?;
                    let arg = self.parse_expression("isset clause")?;
                    self.expect_symbol(Symbol::RParen, "isset clause")?;
                    if !matches!(
                        arg,
                        Expr::Ident(_) | Expr::Field(_) | Expr::Chain(_) | Expr::Index(_)
                    ) {
                        return Err(self.error_at(
                            &token,
                            format!("unexpected {arg} in isset clause"),
                        ));
                    }
                    return Ok(Expr::Isset(Box::new(IssetExpr {
                        pos: token.pos,
                        line: token.line,
                        arg,
                    })));
                }
                Ok(Expr::Ident(IdentExpr {
                    pos: token.pos,
                    line: token.line,
                    name: name.clone(),
                }))
            }
            TokenKind::Identifier(name) => Ok(Expr::Ident(IdentExpr {
                pos: token.pos,
                line: token.line,
                name: name.clone(),
            })),
            TokenKind::Field(name) => Ok(Expr::Field(Box::new(FieldExpr {
                pos: token.pos,
                line: token.line,
                idents: vec![name.clone()],
            }))),
            TokenKind::Keyword(Keyword::Nil) => Ok(Expr::Nil(NilLit {
                pos: token.pos,
                line: token.line,
            })),
            TokenKind::Bool(value) => Ok(Expr::Bool(BoolLit {
                pos: token.pos,
                line: token.line,
                value: *value,
            })),
            TokenKind::Number(raw) => {
                let value = parse_number(raw)
                    .map_err(|message| self.error_at(&token, message))?;
                Ok(Expr::Number(Box::new(NumberLit {
                    pos: token.pos,
                    line: token.line,
                    raw: raw.clone(),
                    value,
                })))
            }
            TokenKind::Str(value) => Ok(Expr::Str(Box::new(StrLit {
                pos: token.pos,
                line: token.line,
                raw: quote_string(value),
                value: value.clone(),
            }))),
            TokenKind::RawStr(value) => Ok(Expr::Str(Box::new(StrLit {
                pos: token.pos,
                line: token.line,
                raw: format!("`{value}`"),
                value: value.clone(),
            }))),
            TokenKind::Symbol(Symbol::LParen) => {
                let expr = self.parse_expression("parenthesized expression")?;
                self.expect_symbol(Symbol::RParen, "parenthesized expression")?;
                Ok(expr)
            }
            _ => Err(self.unexpected(&token, context)),
        }
    }
}

enum SetOrExpr {
    Set(SetClause),
    Expr(Expr),
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary(Box::new(BinaryExpr {
        pos: left.pos(),
        line: left.line(),
        op,
        left,
        right,
    }))
}

/// Re-quote a decoded string for print-back using only the escapes the
/// lexer understands.
fn quote_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Convert a numeric literal: integers (decimal, hex, octal, binary, and
/// character constants) stay integral, falling back to uint and then float
/// on overflow; a trailing `i` marks a complex constant, which is lexed
/// but not supported.
fn parse_number(raw: &str) -> Result<NumberValue, String> {
    if raw.starts_with('\'') {
        return parse_char_literal(raw);
    }
    if raw.ends_with('i') {
        return Err(format!("unsupported complex literal {raw}"));
    }

    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let cleaned: String = body.chars().filter(|&c| c != '_').collect();

    let radix = if cleaned.starts_with("0x") || cleaned.starts_with("0X") {
        Some(16)
    } else if cleaned.starts_with("0o") || cleaned.starts_with("0O") {
        Some(8)
    } else if cleaned.starts_with("0b") || cleaned.starts_with("0B") {
        Some(2)
    } else {
        None
    };
    if let Some(radix) = radix {
        let digits = &cleaned[2..];
        let value = u64::from_str_radix(digits, radix)
            .map_err(|_| format!("bad number syntax {raw:?}"))?;
        if negative {
            if value > i64::MAX as u64 {
                return Err(format!("integer literal {raw} overflows"));
            }
            return Ok(NumberValue::Int(-(value as i64)));
        }
        if value <= i64::MAX as u64 {
            return Ok(NumberValue::Int(value as i64));
        }
        return Ok(NumberValue::Uint(value));
    }

    let is_float = cleaned.contains('.') || cleaned.contains('e') || cleaned.contains('E');
    if !is_float {
        let signed: String = if negative {
            format!("-{cleaned}")
        } else {
            cleaned.clone()
        };
        if let Ok(value) = signed.parse::<i64>() {
            return Ok(NumberValue::Int(value));
        }
        if !negative {
            if let Ok(value) = cleaned.parse::<u64>() {
                return Ok(NumberValue::Uint(value));
            }
        }
        // out-of-range integers degrade to float
        if let Ok(value) = signed.parse::<f64>() {
            return Ok(NumberValue::Float(value));
        }
        return Err(format!("bad number syntax {raw:?}"));
    }

    let signed: String = if negative {
        format!("-{cleaned}")
    } else {
        cleaned
    };
    signed
        .parse::<f64>()
        .map(NumberValue::Float)
        .map_err(|_| format!("bad number syntax {raw:?}"))
}

fn parse_char_literal(raw: &str) -> Result<NumberValue, String> {
    let inner = raw
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .ok_or_else(|| format!("bad character literal {raw:?}"))?;
    let ch = if let Some(escaped) = inner.strip_prefix('\\') {
        match escaped {
            "n" => '\n',
            "r" => '\r',
            "t" => '\t',
            "0" => '\0',
            "\\" => '\\',
            "'" => '\'',
            "\"" => '"',
            other => {
                return Err(format!("unknown escape sequence `\\{other}` in character literal"))
            }
        }
    } else {
        let mut chars = inner.chars();
        let ch = chars
            .next()
            .ok_or_else(|| format!("empty character literal {raw:?}"))?;
        if chars.next().is_some() {
            return Err(format!("bad character literal {raw:?}"));
        }
        ch
    };
    Ok(NumberValue::Int(ch as i64))
}
