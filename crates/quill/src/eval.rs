use crate::ast::*;
use crate::diagnostics::{QuillError, QuillResult};
use crate::ranger::ranger_for;
use crate::runtime::{ContentCont, Out, Runtime};
use crate::set::Template;
use crate::value::{
    index_value, is_numeric, resolve_field, slice_value, to_float, to_int, to_uint, Arguments,
    FieldLookup, Function, Value,
};
use smol_str::SmolStr;
use std::sync::Arc;

/// Control flow threaded out of statement lists: `return` unwinds to the
/// template boundary, everything else keeps walking.
pub(crate) enum ExecState {
    Normal,
    Returned(Value),
}

enum CmdResult {
    Value(Value),
    /// The stage was a safe writer; it wrote directly and ends the
    /// pipeline.
    Safe,
}

fn is_underscore(expr: &Expr) -> bool {
    matches!(expr, Expr::Ident(id) if id.name == "_")
}

fn is_default_cmd(cmd: &Command) -> bool {
    matches!(&cmd.base, Expr::Ident(id) if id.name == "default")
}

impl<'r> Runtime<'r> {
    pub(crate) fn execute_list(&mut self, list: &List) -> QuillResult<ExecState> {
        let mut pushed_scope = false;
        let result = self.execute_list_inner(list, &mut pushed_scope);
        if pushed_scope {
            self.pop_scope();
        }
        result
    }

    fn execute_list_inner(
        &mut self,
        list: &List,
        pushed_scope: &mut bool,
    ) -> QuillResult<ExecState> {
        for node in &list.nodes {
            match node {
                Stmt::Text(text) => {
                    self.write_raw(text.text.as_bytes())
                        .map_err(|e| self.error(text.line, format!("write error: {e}")))?;
                }
                Stmt::Action(action) => {
                    match self.execute_action(action, pushed_scope) {
                        Ok(()) => {}
                        Err(err) => {
                            if self.set.abort_on_error() {
                                return Err(err);
                            }
                            log::error!("{err}");
                        }
                    }
                }
                Stmt::If(stmt) => match self.execute_if(stmt)? {
                    ExecState::Normal => {}
                    returned => return Ok(returned),
                },
                Stmt::Range(stmt) => match self.execute_range(stmt)? {
                    ExecState::Normal => {}
                    returned => return Ok(returned),
                },
                Stmt::Block(stmt) => {
                    // Define-and-yield: an override installed by an
                    // extending template wins over the local definition.
                    let block = self.lookup_block(&stmt.name).unwrap_or_else(|| Arc::clone(stmt));
                    let state = self.execute_yield_block(
                        &block,
                        &[],
                        block.context.as_ref(),
                        block.content.as_ref().map(Arc::clone),
                    )?;
                    if let ExecState::Returned(_) = state {
                        return Ok(state);
                    }
                }
                Stmt::Yield(stmt) => match &stmt.kind {
                    YieldKind::Content { context } => {
                        match self.invoke_content(context.as_ref())? {
                            ExecState::Normal => {}
                            returned => return Ok(returned),
                        }
                    }
                    YieldKind::Block { name, args, context, content } => {
                        let block = self.lookup_block(name).ok_or_else(|| {
                            self.error(stmt.line, format!("unresolved block {name:?}"))
                        })?;
                        let state = self.execute_yield_block(
                            &block,
                            args,
                            context.as_ref(),
                            content.as_ref().map(Arc::clone),
                        )?;
                        if let ExecState::Returned(_) = state {
                            return Ok(state);
                        }
                    }
                },
                Stmt::Include(stmt) => {
                    self.execute_include(stmt)?;
                }
                Stmt::Return(stmt) => {
                    let value = match &stmt.value {
                        Some(expr) => self.eval_expr(expr)?,
                        None => Value::Invalid,
                    };
                    return Ok(ExecState::Returned(value));
                }
                Stmt::Try(stmt) => match self.execute_try(stmt)? {
                    ExecState::Normal => {}
                    returned => return Ok(returned),
                },
            }
        }
        Ok(ExecState::Normal)
    }

    fn execute_action(
        &mut self,
        action: &ActionStmt,
        pushed_scope: &mut bool,
    ) -> QuillResult<()> {
        if let Some(set) = &action.set {
            if set.decl && !*pushed_scope {
                // a top-level `let` opens a scope that lasts until the
                // enclosing list finishes
                self.push_scope();
                *pushed_scope = true;
            }
            self.execute_set_clause(set)?;
        }
        if let Some(pipe) = &action.pipe {
            let (value, safe) = self.eval_pipeline(pipe)?;
            if !safe && value.is_valid() {
                self.render_value(&value)
                    .map_err(|e| self.error(action.line, format!("write error: {e}")))?;
            }
        }
        Ok(())
    }

    fn execute_set_clause(&mut self, set: &SetClause) -> QuillResult<()> {
        let values = self.eval_set_values(set)?;
        for (target, value) in set.left.iter().zip(values) {
            let name = match target {
                Expr::Ident(id) => &id.name,
                other => {
                    return Err(self.error(
                        other.line(),
                        "assignment target must be an identifier",
                    ))
                }
            };
            if set.decl {
                self.declare(name, value);
            } else {
                self.assign(name, value);
            }
        }
        Ok(())
    }

    fn eval_set_values(&mut self, set: &SetClause) -> QuillResult<Vec<Value>> {
        if set.index_lookup {
            // v, ok := m[key] — the probe result plus a presence flag
            let value = self.eval_expr(&set.right[0])?;
            let present = value.is_valid();
            return Ok(vec![value, Value::Bool(present)]);
        }
        set.right.iter().map(|expr| self.eval_expr(expr)).collect()
    }

    fn execute_if(&mut self, stmt: &IfStmt) -> QuillResult<ExecState> {
        let mut scoped = false;
        if let Some(set) = &stmt.set {
            if set.decl {
                self.push_scope();
                scoped = true;
            }
            if let Err(err) = self.execute_set_clause(set) {
                if scoped {
                    self.pop_scope();
                }
                return Err(err);
            }
        }
        let result = match self.eval_expr(&stmt.cond) {
            Ok(cond) => {
                if cond.is_truthy() {
                    self.execute_list(&stmt.then_list)
                } else if let Some(else_list) = &stmt.else_list {
                    self.execute_list(else_list)
                } else {
                    Ok(ExecState::Normal)
                }
            }
            Err(err) => Err(err),
        };
        if scoped {
            self.pop_scope();
        }
        result
    }

    fn execute_range(&mut self, stmt: &RangeStmt) -> QuillResult<ExecState> {
        let producer = match &stmt.set {
            Some(set) => self.eval_expr(&set.right[0])?,
            None => {
                let expr = stmt.expr.as_ref().expect("parser guarantees a producer");
                self.eval_expr(expr)?
            }
        };

        let scoped = stmt.set.as_ref().map_or(false, |s| s.decl);
        if scoped {
            self.push_scope();
        }
        let saved_context = self.context.clone();
        let result = self.run_range_loop(stmt, &producer);
        self.context = saved_context;
        if scoped {
            self.pop_scope();
        }
        result
    }

    fn run_range_loop(&mut self, stmt: &RangeStmt, producer: &Value) -> QuillResult<ExecState> {
        let mut ranger = ranger_for(producer).map_err(|m| self.error(stmt.line, m))?;

        let (key_target, value_target) = match &stmt.set {
            Some(set) if set.left.len() == 2 => (Some(&set.left[0]), Some(&set.left[1])),
            Some(set) => (None, Some(&set.left[0])),
            None => (None, None),
        };
        if key_target.is_some() && !ranger.provides_index() {
            return Err(self.error(stmt.line, "ranger does not provide an index"));
        }

        let mut iterated = false;
        while let Some((key, value)) = ranger.range()? {
            iterated = true;
            if let Some(set) = &stmt.set {
                if let Some(target) = key_target {
                    self.bind_range_target(set, target, key)?;
                }
                if let Some(target) = value_target {
                    self.bind_range_target(set, target, value)?;
                }
            } else {
                self.context = value;
            }
            match self.execute_list(&stmt.body)? {
                ExecState::Normal => {}
                returned => return Ok(returned),
            }
        }

        if !iterated {
            if let Some(else_list) = &stmt.else_list {
                return self.execute_list(else_list);
            }
        }
        Ok(ExecState::Normal)
    }

    fn bind_range_target(
        &mut self,
        set: &SetClause,
        target: &Expr,
        value: Value,
    ) -> QuillResult<()> {
        let name = match target {
            Expr::Ident(id) => &id.name,
            other => {
                return Err(self.error(other.line(), "range target must be an identifier"))
            }
        };
        if set.decl {
            self.declare(name, value);
        } else {
            self.assign(name, value);
        }
        Ok(())
    }

    fn execute_yield_block(
        &mut self,
        block: &Arc<BlockStmt>,
        args: &[YieldArg],
        context_expr: Option<&Expr>,
        content: Option<Arc<List>>,
    ) -> QuillResult<ExecState> {
        let need_scope = !block.params.list.is_empty() || !args.is_empty();
        if need_scope {
            self.push_scope();
            if let Err(err) = self.bind_block_params(block, args) {
                self.pop_scope();
                return Err(err);
            }
        }

        let saved_content = self.content.clone();
        if let Some(body) = content {
            self.content = Some(ContentCont {
                body,
                frame_len: self.frames.len(),
                prev: saved_content.clone().map(Box::new),
            });
        }

        let result = match context_expr {
            Some(expr) => match self.eval_expr(expr) {
                Ok(ctx) => {
                    let saved_ctx = std::mem::replace(&mut self.context, ctx);
                    let state = self.execute_list(&block.body);
                    self.context = saved_ctx;
                    state
                }
                Err(err) => Err(err),
            },
            None => self.execute_list(&block.body),
        };

        self.content = saved_content;
        if need_scope {
            self.pop_scope();
        }
        result
    }

    fn bind_block_params(&mut self, block: &Arc<BlockStmt>, args: &[YieldArg]) -> QuillResult<()> {
        let params = &block.params.list;
        let mut bound: Vec<SmolStr> = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let name = match &arg.name {
                Some(name) => {
                    if !params.iter().any(|p| p.name == *name) {
                        return Err(self.error(
                            arg.value.line(),
                            format!("block {:?} has no parameter {name:?}", block.name),
                        ));
                    }
                    name.clone()
                }
                None => match params.get(i) {
                    Some(param) => param.name.clone(),
                    None => {
                        return Err(self.error(
                            arg.value.line(),
                            format!("too many arguments in yield of block {:?}", block.name),
                        ))
                    }
                },
            };
            let value = self.eval_expr(&arg.value)?;
            self.declare(&name, value);
            bound.push(name);
        }
        for param in params {
            if bound.iter().any(|name| *name == param.name) {
                continue;
            }
            let value = match &param.default {
                Some(default) => self.eval_expr(default)?,
                None => Value::Bool(false),
            };
            self.declare(&param.name, value);
        }
        Ok(())
    }

    fn invoke_content(&mut self, context_expr: Option<&Expr>) -> QuillResult<ExecState> {
        let Some(cont) = self.content.clone() else {
            return Ok(ExecState::Normal);
        };
        let tail = self.frames.split_off(cont.frame_len);
        let saved_content =
            std::mem::replace(&mut self.content, cont.prev.clone().map(|boxed| *boxed));

        // the context expression evaluates in the captured scope, like the
        // body it wraps
        let result = match context_expr {
            Some(expr) => match self.eval_expr(expr) {
                Ok(ctx) => {
                    let saved_ctx = std::mem::replace(&mut self.context, ctx);
                    let state = self.execute_list(&cont.body);
                    self.context = saved_ctx;
                    state
                }
                Err(err) => Err(err),
            },
            None => self.execute_list(&cont.body),
        };

        self.content = saved_content;
        self.frames.extend(tail);
        result
    }

    fn execute_include(&mut self, stmt: &IncludeStmt) -> QuillResult<()> {
        let name_value = self.eval_expr(&stmt.name)?;
        let name = match &name_value {
            Value::String(s) => s.clone(),
            other => {
                return Err(self.error(
                    stmt.line,
                    format!("unexpected expression type {} in include", other.type_name()),
                ))
            }
        };
        let context = match &stmt.context {
            Some(expr) => Some(self.eval_expr(expr)?),
            None => None,
        };
        let sibling = self.current_name().to_string();
        let template = self
            .set
            .get_sibling_template(&name, &sibling)
            .map_err(|e| self.error(stmt.line, format!("include: {e}")))?;
        self.run_template(&template, context)?;
        Ok(())
    }

    /// Execute another template in a child scope whose block table is the
    /// template's own. A `return` inside it does not unwind the caller.
    pub(crate) fn run_template(
        &mut self,
        template: &Arc<Template>,
        context: Option<Value>,
    ) -> QuillResult<ExecState> {
        self.push_scope_with_blocks(Arc::clone(&template.processed_blocks));
        let saved_context = context.map(|ctx| std::mem::replace(&mut self.context, ctx));
        self.name_stack.push(template.name.clone());

        let mut root: &Template = template;
        while let Some(parent) = &root.extends {
            root = parent.as_ref();
        }
        let result = self.execute_list(&root.root);

        self.name_stack.pop();
        if let Some(saved) = saved_context {
            self.context = saved;
        }
        self.pop_scope();
        result
    }

    /// Render another template into the current output (the
    /// `includeIfExists` path).
    pub fn include(&mut self, name: &str, context: Option<Value>) -> QuillResult<()> {
        let sibling = self.current_name().to_string();
        let template = self.set.get_sibling_template(name, &sibling)?;
        self.run_template(&template, context)?;
        Ok(())
    }

    /// Execute a template for its `return` value, discarding its output
    /// (the `exec` path).
    pub fn exec(&mut self, name: &str, context: Option<Value>) -> QuillResult<Value> {
        let sibling = self.current_name().to_string();
        let template = self.set.get_sibling_template(name, &sibling)?;
        let saved_out = std::mem::replace(&mut self.out, Out::Sink);
        let result = self.run_template(&template, context);
        self.out = saved_out;
        match result? {
            ExecState::Returned(value) => Ok(value),
            ExecState::Normal => Ok(Value::Invalid),
        }
    }

    fn execute_try(&mut self, stmt: &TryStmt) -> QuillResult<ExecState> {
        let frame_len = self.frames.len();
        match self.execute_list(&stmt.body) {
            Ok(state) => Ok(state),
            Err(err) => {
                // scopes opened inside the failed body are abandoned
                self.frames.truncate(frame_len);
                if let Some(catch_body) = &stmt.catch_body {
                    self.push_scope();
                    if let Some(ident) = &stmt.catch_ident {
                        let message = Value::String(err.message());
                        self.declare(ident, message);
                    }
                    let state = self.execute_list(catch_body);
                    self.pop_scope();
                    state
                } else {
                    Ok(ExecState::Normal)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Pipelines

    pub(crate) fn eval_pipeline(&mut self, pipe: &Pipeline) -> QuillResult<(Value, bool)> {
        let mut value = Value::Invalid;
        let mut safe = false;

        for (i, cmd) in pipe.cmds.iter().enumerate() {
            if safe {
                return Err(self.error(
                    cmd.line,
                    "unexpected command: a writer command must be the last pipeline stage",
                ));
            }
            if is_default_cmd(cmd) {
                if i == 0 {
                    return Err(self.error(
                        cmd.line,
                        "wrong default order, the probed value must come before it",
                    ));
                }
                if !value.is_valid() {
                    let fallback = cmd.args.first().ok_or_else(|| {
                        self.error(cmd.line, "default requires a fallback argument")
                    })?;
                    value = self.eval_expr(fallback)?;
                }
                continue;
            }

            let piped = if i == 0 { None } else { Some(value.clone()) };
            let soft = matches!(pipe.cmds.get(i + 1), Some(next) if is_default_cmd(next));
            let result = if soft {
                match self.eval_command(cmd, piped) {
                    Ok(result) => result,
                    Err(_) => CmdResult::Value(Value::Invalid),
                }
            } else {
                self.eval_command(cmd, piped)?
            };
            match result {
                CmdResult::Value(v) => value = v,
                CmdResult::Safe => {
                    safe = true;
                    value = Value::Invalid;
                }
            }
        }
        Ok((value, safe))
    }

    fn eval_command(&mut self, cmd: &Command, piped: Option<Value>) -> QuillResult<CmdResult> {
        // A paren-call stage receiving a piped value pins it at a `_`
        // placeholder in the call's own argument list.
        if piped.is_some() {
            if let Expr::Call(call) = &cmd.base {
                let callee = self.eval_expr(&call.base)?;
                return self.apply_stage(callee, &call.args, piped, cmd, true);
            }
        }
        let base = self.eval_expr(&cmd.base)?;
        self.apply_stage(base, &cmd.args, piped, cmd, cmd.call)
    }

    fn apply_stage(
        &mut self,
        base: Value,
        args: &[Expr],
        piped: Option<Value>,
        cmd: &Command,
        call: bool,
    ) -> QuillResult<CmdResult> {
        match base {
            Value::Safe(writer) if call || piped.is_some() => {
                let mut values = Vec::new();
                if let Some(p) = piped {
                    values.push(p);
                }
                for arg in args {
                    values.push(self.eval_expr(arg)?);
                }
                for v in values {
                    let outcome = match &v {
                        Value::Bytes(bytes) => {
                            let owned = Arc::clone(bytes);
                            self.write_safe(writer, &owned)
                        }
                        other => self.write_safe(writer, other.to_string().as_bytes()),
                    };
                    outcome.map_err(|e| self.error(cmd.line, format!("write error: {e}")))?;
                }
                Ok(CmdResult::Safe)
            }
            Value::Func(func) if call || piped.is_some() => {
                let args = self.eval_args_with_piped(args, piped)?;
                let value = self.call_function(&func, args, cmd.line)?;
                Ok(CmdResult::Value(value))
            }
            other => {
                if call {
                    return Err(self.error(
                        cmd.line,
                        format!("command {} is not callable ({})", cmd.base, other.type_name()),
                    ));
                }
                if piped.is_some() {
                    return Err(self.error(
                        cmd.line,
                        format!(
                            "pipe stage {} is not callable ({})",
                            cmd.base,
                            other.type_name()
                        ),
                    ));
                }
                Ok(CmdResult::Value(other))
            }
        }
    }

    /// Evaluate call arguments, pinning the piped value at a `_`
    /// placeholder or appending it last.
    fn eval_args_with_piped(
        &mut self,
        args: &[Expr],
        piped: Option<Value>,
    ) -> QuillResult<Vec<Value>> {
        match piped {
            None => args.iter().map(|arg| self.eval_expr(arg)).collect(),
            Some(piped) => {
                let mut out = Vec::with_capacity(args.len() + 1);
                let mut used = false;
                for arg in args {
                    if !used && is_underscore(arg) {
                        out.push(piped.clone());
                        used = true;
                    } else {
                        out.push(self.eval_expr(arg)?);
                    }
                }
                if !used {
                    out.push(piped);
                }
                Ok(out)
            }
        }
    }

    fn call_function(
        &mut self,
        func: &Function,
        args: Vec<Value>,
        line: u32,
    ) -> QuillResult<Value> {
        let result = match func {
            Function::Native(imp) => {
                let imp = Arc::clone(imp);
                imp(self, Arguments::new(args))
            }
            Function::Method { recv, name } => recv.call_method(name, Arguments::new(args)),
        };
        result.map_err(|err| match err {
            err @ (QuillError::Runtime { .. } | QuillError::Parse { .. }) => err,
            other => self.error(line, other.message()),
        })
    }

    // ------------------------------------------------------------------
    // Expressions

    pub(crate) fn eval_expr(&mut self, expr: &Expr) -> QuillResult<Value> {
        match expr {
            Expr::Nil(_) => Ok(Value::Invalid),
            Expr::Bool(lit) => Ok(Value::Bool(lit.value)),
            Expr::Number(lit) => Ok(match lit.value {
                NumberValue::Int(n) => Value::Int(n),
                NumberValue::Uint(n) => Value::Uint(n),
                NumberValue::Float(n) => Value::Float(n),
            }),
            Expr::Str(lit) => Ok(Value::String(lit.value.clone())),
            Expr::Ident(ident) => {
                let resolved = self.resolve(&ident.name);
                if !resolved.is_valid() && ident.name != "." {
                    return Err(self.error(
                        ident.line,
                        format!(
                            "identifier {:?} is not available in the current scope",
                            ident.name
                        ),
                    ));
                }
                Ok(resolved)
            }
            Expr::Field(field) => {
                let base = self.context();
                self.eval_field_chain(base, &field.idents, field.line)
            }
            Expr::Chain(chain) => {
                let base = self.eval_expr(&chain.base)?;
                self.eval_field_chain(base, &chain.fields, chain.line)
            }
            Expr::Unary(unary) => {
                let value = self.eval_expr(&unary.expr)?;
                self.eval_unary(unary, value)
            }
            Expr::Not(not) => {
                let value = self.eval_expr(&not.expr)?;
                Ok(Value::Bool(!value.is_truthy()))
            }
            Expr::Binary(binary) => self.eval_binary(binary),
            Expr::Ternary(ternary) => {
                let cond = self.eval_expr(&ternary.cond)?;
                if cond.is_truthy() {
                    self.eval_expr(&ternary.left)
                } else {
                    self.eval_expr(&ternary.right)
                }
            }
            Expr::Call(call) => {
                let base = self.eval_expr(&call.base)?;
                match base {
                    Value::Func(func) => {
                        let args = self.eval_args_with_piped(&call.args, None)?;
                        self.call_function(&func, args, call.line)
                    }
                    other => Err(self.error(
                        call.line,
                        format!("{} is not callable ({})", call.base, other.type_name()),
                    )),
                }
            }
            Expr::Index(index) => {
                let base = self.eval_expr(&index.base)?;
                let key = self.eval_expr(&index.index)?;
                index_value(&base, &key).map_err(|m| self.error(index.line, m))
            }
            Expr::Slice(slice) => {
                let base = self.eval_expr(&slice.base)?;
                let start = match &slice.start {
                    Some(expr) => {
                        let v = self.eval_expr(expr)?;
                        Some(to_int(&v).map_err(|m| self.error(slice.line, m))?)
                    }
                    None => None,
                };
                let end = match &slice.end {
                    Some(expr) => {
                        let v = self.eval_expr(expr)?;
                        Some(to_int(&v).map_err(|m| self.error(slice.line, m))?)
                    }
                    None => None,
                };
                slice_value(&base, start, end).map_err(|m| self.error(slice.line, m))
            }
            Expr::Isset(isset) => Ok(Value::Bool(self.probe_is_set(&isset.arg))),
        }
    }

    fn eval_field_chain(
        &mut self,
        base: Value,
        fields: &[SmolStr],
        line: u32,
    ) -> QuillResult<Value> {
        let mut current = base;
        for (i, field) in fields.iter().enumerate() {
            let terminal = i + 1 == fields.len();
            match resolve_field(field, &current) {
                FieldLookup::Found(value) => current = value,
                FieldLookup::MissingKey if terminal => return Ok(Value::Invalid),
                FieldLookup::MissingKey | FieldLookup::NoSuchField => {
                    return Err(self.error(
                        line,
                        format!(
                            "there is no field or method {field:?} in {}",
                            current.type_name()
                        ),
                    ));
                }
            }
        }
        Ok(current)
    }

    fn eval_unary(&mut self, unary: &UnaryExpr, value: Value) -> QuillResult<Value> {
        let negate = unary.op == UnaryOp::Neg;
        match value {
            Value::Int(n) => Ok(Value::Int(if negate { n.wrapping_neg() } else { n })),
            Value::Uint(n) => {
                if !negate {
                    return Ok(Value::Uint(n));
                }
                if n <= i64::MAX as u64 {
                    Ok(Value::Int(-(n as i64)))
                } else {
                    Err(self.error(unary.line, "negation overflows"))
                }
            }
            Value::Float(n) => Ok(Value::Float(if negate { -n } else { n })),
            other => Err(self.error(
                unary.line,
                format!("a non numeric value ({}) in sign expression", other.type_name()),
            )),
        }
    }

    fn eval_binary(&mut self, node: &BinaryExpr) -> QuillResult<Value> {
        use BinaryOp::*;
        match node.op {
            And => {
                let left = self.eval_expr(&node.left)?;
                if !left.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                let right = self.eval_expr(&node.right)?;
                Ok(Value::Bool(right.is_truthy()))
            }
            Or => {
                let left = self.eval_expr(&node.left)?;
                if left.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                let right = self.eval_expr(&node.right)?;
                Ok(Value::Bool(right.is_truthy()))
            }
            Eq | NotEq => {
                let left = self.eval_expr(&node.left)?;
                let right = self.eval_expr(&node.right)?;
                let equal = left.equals(&right);
                Ok(Value::Bool(if node.op == Eq { equal } else { !equal }))
            }
            Lt | Le | Gt | Ge => {
                let left = self.eval_expr(&node.left)?;
                let right = self.eval_expr(&node.right)?;
                self.eval_numeric_compare(node, &left, &right)
            }
            Add | Sub => {
                let left = self.eval_expr(&node.left)?;
                let right = self.eval_expr(&node.right)?;
                self.eval_additive(node, left, right)
            }
            Mul | Div | Mod => {
                let left = self.eval_expr(&node.left)?;
                let right = self.eval_expr(&node.right)?;
                self.eval_multiplicative(node, left, right)
            }
        }
    }

    fn eval_numeric_compare(
        &self,
        node: &BinaryExpr,
        left: &Value,
        right: &Value,
    ) -> QuillResult<Value> {
        use BinaryOp::*;
        if let (Value::String(a), Value::String(b)) = (left, right) {
            let truth = match node.op {
                Lt => a < b,
                Le => a <= b,
                Gt => a > b,
                Ge => a >= b,
                _ => unreachable!(),
            };
            return Ok(Value::Bool(truth));
        }
        if !is_numeric(left.kind()) || !is_numeric(right.kind()) {
            return Err(self.error(
                node.line,
                "a non numeric value in numeric comparative expression",
            ));
        }
        let truth = if matches!(left, Value::Float(_)) || matches!(right, Value::Float(_)) {
            let a = to_float(left).expect("checked numeric");
            let b = to_float(right).expect("checked numeric");
            match node.op {
                Lt => a < b,
                Le => a <= b,
                Gt => a > b,
                Ge => a >= b,
                _ => unreachable!(),
            }
        } else {
            let a = widen128(left);
            let b = widen128(right);
            match node.op {
                Lt => a < b,
                Le => a <= b,
                Gt => a > b,
                Ge => a >= b,
                _ => unreachable!(),
            }
        };
        Ok(Value::Bool(truth))
    }

    fn eval_additive(
        &self,
        node: &BinaryExpr,
        left: Value,
        right: Value,
    ) -> QuillResult<Value> {
        let add = node.op == BinaryOp::Add;
        match (&left, &right) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                if !add {
                    return Err(self.error(node.line, "strings in subtraction"));
                }
                // string concatenation formats the non-string side
                Ok(Value::String(format!("{left}{right}")))
            }
            _ => {
                if !is_numeric(left.kind()) || !is_numeric(right.kind()) {
                    return Err(self.error(
                        node.line,
                        "a non numeric value in additive expression",
                    ));
                }
                if matches!(left, Value::Float(_)) || matches!(right, Value::Float(_)) {
                    let a = to_float(&left).expect("checked numeric");
                    let b = to_float(&right).expect("checked numeric");
                    Ok(Value::Float(if add { a + b } else { a - b }))
                } else {
                    match left {
                        Value::Int(a) => {
                            let b = to_int(&right).expect("checked numeric");
                            Ok(Value::Int(if add {
                                a.wrapping_add(b)
                            } else {
                                a.wrapping_sub(b)
                            }))
                        }
                        Value::Uint(a) => {
                            let b = to_uint(&right).expect("checked numeric");
                            Ok(Value::Uint(if add {
                                a.wrapping_add(b)
                            } else {
                                a.wrapping_sub(b)
                            }))
                        }
                        _ => unreachable!("numeric kinds are int, uint or float"),
                    }
                }
            }
        }
    }

    fn eval_multiplicative(
        &self,
        node: &BinaryExpr,
        left: Value,
        right: Value,
    ) -> QuillResult<Value> {
        use BinaryOp::*;
        if !is_numeric(left.kind()) || !is_numeric(right.kind()) {
            return Err(self.error(
                node.line,
                "a non numeric value in multiplicative expression",
            ));
        }
        if node.op == Mod {
            let b = to_int(&right).expect("checked numeric");
            return match left {
                Value::Uint(a) => {
                    let b = to_uint(&right).expect("checked numeric");
                    Ok(Value::Uint(a % b))
                }
                _ => {
                    let a = to_int(&left).expect("checked numeric");
                    Ok(Value::Int(a % b))
                }
            };
        }
        if matches!(left, Value::Float(_)) || matches!(right, Value::Float(_)) {
            let a = to_float(&left).expect("checked numeric");
            let b = to_float(&right).expect("checked numeric");
            return Ok(Value::Float(if node.op == Mul { a * b } else { a / b }));
        }
        match left {
            Value::Int(a) => {
                let b = to_int(&right).expect("checked numeric");
                Ok(Value::Int(if node.op == Mul { a.wrapping_mul(b) } else { a / b }))
            }
            Value::Uint(a) => {
                let b = to_uint(&right).expect("checked numeric");
                Ok(Value::Uint(if node.op == Mul { a.wrapping_mul(b) } else { a / b }))
            }
            _ => unreachable!("numeric kinds are int, uint or float"),
        }
    }

    // ------------------------------------------------------------------
    // isset

    /// Soft probe: resolves like evaluation but maps every failure to
    /// `false` instead of an error.
    pub(crate) fn probe_is_set(&mut self, expr: &Expr) -> bool {
        match expr {
            Expr::Ident(ident) => {
                if ident.name == "." {
                    return self.context.is_valid();
                }
                self.resolve(&ident.name).is_valid()
            }
            Expr::Field(field) => {
                let base = self.context();
                self.probe_chain(base, &field.idents)
            }
            Expr::Chain(chain) => match self.eval_expr(&chain.base) {
                Ok(base) => self.probe_chain(base, &chain.fields),
                Err(_) => false,
            },
            Expr::Index(index) => {
                let Ok(base) = self.eval_expr(&index.base) else {
                    return false;
                };
                let Ok(key) = self.eval_expr(&index.index) else {
                    return false;
                };
                match index_value(&base, &key) {
                    Ok(value) => value.is_valid(),
                    Err(_) => false,
                }
            }
            other => match self.eval_expr(other) {
                Ok(value) => value.is_valid(),
                Err(_) => false,
            },
        }
    }

    fn probe_chain(&mut self, base: Value, fields: &[SmolStr]) -> bool {
        let mut current = base;
        for field in fields {
            match resolve_field(field, &current) {
                FieldLookup::Found(value) => current = value,
                _ => return false,
            }
        }
        current.is_valid()
    }
}

fn widen128(v: &Value) -> i128 {
    match v {
        Value::Int(n) => *n as i128,
        Value::Uint(n) => *n as i128,
        Value::Float(n) => *n as i128,
        _ => 0,
    }
}
