//! Tree-walking evaluator. Runs the same semantics as the VM straight off
//! the AST; both go through the [`Runtime`] operations so the two paths
//! cannot drift apart.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::ast::{Node, NodeKind};
use crate::bytecode::{FsLoader, SourceLoader};
use crate::error::{MangoError, MangoResult, SourcePos};
use crate::names::Context;
use crate::object::{self, FuncBody, ObjRef};
use crate::parser;
use crate::runtime::{Runtime, STACK_GROW_SIZE, STACK_RED_ZONE};

pub struct Interpreter<'r> {
    rt: &'r mut Runtime,
    ctx: Rc<Context>,
    /// Files currently being expanded by `include`, outermost first.
    includes: Vec<PathBuf>,
    loader: &'r dyn SourceLoader,
}

/// Evaluates a parsed program in the default context; yields the value of
/// the last top-level statement.
pub fn run(rt: &mut Runtime, root: &Node) -> MangoResult<Option<ObjRef>> {
    let globals = Rc::clone(rt.globals());
    let mut interp = Interpreter::new(rt, globals, &FsLoader);
    if let Some(file) = root.pos.file.as_deref() {
        interp.includes.push(PathBuf::from(file));
    }
    interp.top_level(root.statements())
}

pub(crate) fn call_body(rt: &mut Runtime, fctx: &Rc<Context>, body: &[Node]) -> MangoResult<()> {
    Interpreter::new(rt, Rc::clone(fctx), &FsLoader).block(body)
}

impl<'r> Interpreter<'r> {
    pub fn new(rt: &'r mut Runtime, ctx: Rc<Context>, loader: &'r dyn SourceLoader) -> Self {
        Interpreter { rt, ctx, includes: Vec::new(), loader }
    }

    fn top_level(&mut self, body: &[Node]) -> MangoResult<Option<ObjRef>> {
        let mut last = None;
        for node in body {
            last = Some(self.eval(node)?);
            self.rt.collect();
        }
        Ok(last)
    }

    fn block(&mut self, body: &[Node]) -> MangoResult<()> {
        for node in body {
            self.eval(node)?;
            if self.ctx.has_return() {
                break;
            }
        }
        Ok(())
    }

    fn unit(&self) -> MangoResult<ObjRef> {
        self.rt.heap.int(0)
    }

    pub fn eval(&mut self, node: &Node) -> MangoResult<ObjRef> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.eval_inner(node))
    }

    fn eval_inner(&mut self, node: &Node) -> MangoResult<ObjRef> {
        trace!(node = ?node.node_type(), line = node.pos.line, "eval");
        let pos = &node.pos;
        match &node.kind {
            NodeKind::Int { value } => self.rt.heap.int(*value),
            NodeKind::Str { value } => self.rt.heap.string(value.as_bytes()),
            NodeKind::VarAccess { path } => {
                let obj = self.rt.lookup(&self.ctx, path).map_err(|e| e.at(pos))?;
                obj.set_pos(pos);
                Ok(obj)
            }
            NodeKind::Inc { path } => self.rt.step(&self.ctx, path, 1).map_err(|e| e.at(pos)),
            NodeKind::Dec { path } => self.rt.step(&self.ctx, path, -1).map_err(|e| e.at(pos)),
            NodeKind::GetItem { path, index } => {
                let index = self.eval(index)?;
                let item = self.rt.get_item(&self.ctx, path, &index).map_err(|e| e.at(pos))?;
                item.set_pos(pos);
                Ok(item)
            }
            NodeKind::VarAssign { path, value } => {
                let value = self.eval(value)?;
                self.rt.assign(&self.ctx, path, &value).map_err(|e| e.at(pos))
            }
            NodeKind::SetItem { path, index, value } => {
                let index = self.eval(index)?;
                let value = self.eval(value)?;
                self.rt.set_item(&self.ctx, path, &index, &value).map_err(|e| e.at(pos))
            }
            NodeKind::UnOp { op, operand } => {
                let operand = self.eval(operand)?;
                let result = object::ops::apply_unary_op(&self.rt.heap, &operand, *op).map_err(|e| e.at(pos))?;
                result.set_pos(pos);
                Ok(result)
            }
            NodeKind::BinOp { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                let result = object::ops::apply_binary_op(&self.rt.heap, &lhs, &rhs, *op).map_err(|e| e.at(pos))?;
                result.set_pos(pos);
                Ok(result)
            }
            NodeKind::VarNew { decl, size, value } => {
                let size = size.as_deref().map(|s| self.eval(s)).transpose()?;
                let value = self.eval(value)?;
                let obj = self.rt.declare(&self.ctx, decl, size.as_ref(), Some(&value)).map_err(|e| e.at(pos))?;
                obj.set_pos(pos);
                Ok(obj)
            }
            NodeKind::VarUn { decl, size } => {
                let size = size.as_deref().map(|s| self.eval(s)).transpose()?;
                let obj = self.rt.declare(&self.ctx, decl, size.as_ref(), None).map_err(|e| e.at(pos))?;
                obj.set_pos(pos);
                Ok(obj)
            }
            NodeKind::Call { callee, args } => {
                let callee = self.eval(callee)?;
                let args = args.iter().map(|a| self.eval(a)).collect::<MangoResult<Vec<_>>>()?;
                let result = self.rt.call(&self.ctx, &callee, &args).map_err(|e| e.at(pos))?;
                result.set_pos(pos);
                Ok(result)
            }
            NodeKind::FuncDec { ret, name, params } => self
                .rt
                .declare_function(&self.ctx, ret, name, params, pos.file.clone())
                .map_err(|e| e.at(pos)),
            NodeKind::FuncDef { decl, body } => {
                let decl = self.eval(decl)?;
                let func = decl
                    .function()
                    .ok_or_else(|| MangoError::internal("Function definition without a declaration"))?;
                func.define(FuncBody::Ast(Rc::from(body.as_slice())));
                Ok(decl)
            }
            NodeKind::If { cond, body, otherwise } => {
                if self.eval(cond)?.is_truthy() {
                    self.block(body)?;
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise)?;
                }
                self.unit()
            }
            NodeKind::Else { body } => {
                self.block(body)?;
                self.unit()
            }
            NodeKind::While { cond, body } => {
                while self.eval(cond)?.is_truthy() {
                    self.block(body)?;
                    if self.ctx.has_return() {
                        break;
                    }
                    self.end_iteration(pos)?;
                }
                self.unit()
            }
            NodeKind::For { init, cond, step, body } => {
                self.eval(init)?;
                while self.eval(cond)?.is_truthy() {
                    self.block(body)?;
                    if self.ctx.has_return() {
                        break;
                    }
                    self.eval(step)?;
                    self.end_iteration(pos)?;
                }
                self.unit()
            }
            NodeKind::Statements { body } => {
                self.block(body)?;
                self.unit()
            }
            NodeKind::Return { value } => {
                let value = self.eval(value)?;
                self.rt.set_return(&self.ctx, &value).map_err(|e| e.at(pos))?;
                Ok(value)
            }
            NodeKind::Extern { inner } => {
                let saved = self.ctx.swap_names(self.rt.globals().names());
                let result = self.eval(inner);
                self.ctx.swap_names(saved);
                result
            }
            NodeKind::Const { inner } => {
                let obj = self.eval(inner)?;
                obj.mark_const();
                Ok(obj)
            }
            NodeKind::Unsigned { inner } => {
                let obj = self.eval(inner)?;
                obj.mark_unsigned();
                Ok(obj)
            }
            NodeKind::Struct { name, members } => {
                let scope = self.rt.struct_scope(name, pos.file.clone());
                let outer = std::mem::replace(&mut self.ctx, Rc::clone(&scope));
                let built = self.block(members);
                self.ctx = outer;
                built?;
                self.rt.declare_struct(&self.ctx, name, scope).map_err(|e| e.at(pos))
            }
            NodeKind::Typedef { base, name } => self.rt.typedef(base, name).map_err(|e| e.at(pos)),
            NodeKind::Include { file } => self.include(file, pos),
        }
    }

    fn end_iteration(&mut self, pos: &SourcePos) -> MangoResult<()> {
        self.rt.check_cancelled(Some(pos))?;
        self.rt.collect();
        Ok(())
    }

    /// Evaluates another source file in place. Re-including a file that is
    /// still being expanded does nothing.
    fn include(&mut self, file: &str, at: &SourcePos) -> MangoResult<ObjRef> {
        let path = match at.file.as_deref().and_then(|f| Path::new(f).parent()) {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(file),
            _ => PathBuf::from(file),
        };
        match self.expand(&path, at) {
            Err(e) if e.is_break() => {
                debug!(file = %path.display(), "include cycle, skipping");
                self.unit()
            }
            other => other,
        }
    }

    fn expand(&mut self, path: &Path, at: &SourcePos) -> MangoResult<ObjRef> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.includes.iter().any(|p| p.canonicalize().unwrap_or_else(|_| p.clone()) == key) {
            return Err(MangoError::include_break(&path.display().to_string()));
        }
        let source = self.loader.load(path).map_err(|e| e.at(at))?;
        let name = path.display().to_string();
        let root = parser::parse_source(&source, Some(&name)).map_err(|e| e.with_outer(at))?;

        self.includes.push(key);
        let result = self.block(root.statements()).map_err(|e| e.with_outer(at));
        self.includes.pop();
        result?;
        self.unit()
    }
}
