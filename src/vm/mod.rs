//! Recursive byte-offset interpreter.
//!
//! There is no program counter stepping over fixed-width instructions:
//! each handler reads its own payload through the [`Cursor`], recursing for
//! sub-expressions at the current position. Control-flow nodes carry a
//! child count and a byte length, so a body can be skipped by seeking past
//! it without decoding a single byte of it.

use std::path::Path;
use std::rc::Rc;

use tracing::{info, trace};

use crate::ast::{BinOp, DeclSpec, ParamSpec, TypeSpec, UnaryOp};
use crate::bytecode::format::*;
use crate::bytecode::{Cursor, Opcode, Program};
use crate::error::{ErrorCode, MangoError, MangoResult, SourcePos};
use crate::names::Context;
use crate::object::{self, FuncBody, ObjRef};
use crate::runtime::{Runtime, STACK_GROW_SIZE, STACK_RED_ZONE};

pub struct Vm<'r> {
    rt: &'r mut Runtime,
    ctx: Rc<Context>,
    cursor: Cursor,
    /// File named by the most recent file marker seen on this path.
    file: Option<Rc<str>>,
}

/// Runs a whole executable image in the default context and yields the
/// value of its last top-level instruction.
pub fn run_program(rt: &mut Runtime, program: Rc<Program>) -> MangoResult<Option<ObjRef>> {
    if program.is_library() {
        return Err(MangoError::bytecode(
            ErrorCode::InvalidValue,
            format!("'{}' is a library and cannot be executed directly", program.name()),
        ));
    }
    let globals = Rc::clone(rt.globals());
    Vm::new(rt, globals, program, HEADER_LEN).exec()
}

/// Runs `count` body statements of a bytecode function starting at `start`.
pub(crate) fn call_body(rt: &mut Runtime, ctx: &Rc<Context>, program: Rc<Program>, start: usize, count: u32) -> MangoResult<()> {
    let file = ctx.file();
    let mut vm = Vm { rt, ctx: Rc::clone(ctx), cursor: Cursor::new(program, start), file };
    vm.statements(count)
}

fn bad_bytecode(msg: impl Into<String>) -> MangoError {
    MangoError::bytecode(ErrorCode::InvalidValue, msg)
}

impl<'r> Vm<'r> {
    pub fn new(rt: &'r mut Runtime, ctx: Rc<Context>, program: Rc<Program>, offset: usize) -> Self {
        let file = ctx.file();
        Vm { rt, ctx, cursor: Cursor::new(program, offset), file }
    }

    pub fn position(&self) -> usize {
        self.cursor.position()
    }

    /// Top-level loop: library references, instructions, and a sweep after
    /// each. Stops at the idata table or the end sentinel.
    pub fn exec(&mut self) -> MangoResult<Option<ObjRef>> {
        let mut last = None;
        loop {
            match self.cursor.peek_u8() {
                None | Some(MARK_END) | Some(MARK_IDATA) => break,
                Some(MARK_LIBRARY) => {
                    self.cursor.skip(1)?;
                    let lib = self.cursor.read_ident()?;
                    self.load_library(&lib)?;
                }
                Some(_) => last = Some(self.interpret()?),
            }
            self.rt.collect();
        }
        Ok(last)
    }

    fn load_library(&mut self, lib: &str) -> MangoResult<()> {
        let path = if Path::new(lib).extension().is_none() { format!("{lib}.ml") } else { lib.to_string() };
        let bytes = crate::run::read_all(&path)?;
        let program = Program::load(bytes, &path)?;
        if !program.is_library() {
            return Err(bad_bytecode(format!("'{path}' is not a bytecode library")));
        }
        info!(path, "loading library");
        let globals = Rc::clone(self.rt.globals());
        Vm::new(&mut *self.rt, globals, program, HEADER_LEN).exec()?;
        Ok(())
    }

    /// Interprets the instruction at `offset` and leaves the cursor after it.
    pub fn interpret_at(&mut self, offset: usize) -> MangoResult<ObjRef> {
        self.cursor.seek(offset);
        self.interpret()
    }

    fn statements(&mut self, count: u32) -> MangoResult<()> {
        for _ in 0..count {
            self.interpret()?;
            if self.ctx.has_return() {
                break;
            }
        }
        Ok(())
    }

    /// Runs a counted body, then lands on `end` whether or not a return
    /// cut it short.
    fn block(&mut self, count: u32, end: usize) -> MangoResult<()> {
        self.statements(count)?;
        self.cursor.seek(end);
        Ok(())
    }

    fn block_header(&mut self) -> MangoResult<(u32, usize, usize)> {
        let count = self.cursor.read_u32()?;
        let len = self.cursor.read_u32()? as usize;
        let start = self.cursor.position();
        if start + len > self.cursor.program().len() {
            return Err(bad_bytecode(format!("Body at offset {start} overruns the program")));
        }
        Ok((count, start, start + len))
    }

    fn pos(&mut self) -> MangoResult<Option<SourcePos>> {
        self.cursor.read_pos(self.file.as_ref())
    }

    fn type_spec(&mut self) -> MangoResult<TypeSpec> {
        let pointer = self.cursor.read_u8()? != 0;
        let name = self.cursor.read_ident()?;
        Ok(TypeSpec { name, pointer })
    }

    fn heap_int(&self, v: i32) -> MangoResult<ObjRef> {
        self.rt.heap.int(v)
    }

    /// Evaluates the instruction under the cursor, growing the stack when
    /// nested calls run it low.
    fn interpret(&mut self) -> MangoResult<ObjRef> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.interpret_inner())
    }

    fn interpret_inner(&mut self) -> MangoResult<ObjRef> {
        while self.cursor.peek_u8() == Some(MARK_FILE) {
            self.cursor.skip(1)?;
            let file = self.cursor.read_ident()?;
            self.file = Some(Rc::from(file));
        }
        let at = self.cursor.position();
        let byte = self.cursor.read_u8()?;
        let op = Opcode::decode(byte).ok_or_else(|| bad_bytecode(format!("Unknown opcode {byte:#04x} at offset {at}")))?;
        trace!(offset = at, ?op, "exec");

        match op {
            Opcode::Int => {
                let v = self.cursor.read_i32()?;
                self.heap_int(v)
            }
            Opcode::Str => {
                let bytes = self.cursor.read_string_payload()?;
                self.rt.heap.string(&bytes)
            }
            Opcode::VarAccess => {
                let path = self.cursor.read_path()?;
                let pos = self.pos()?;
                let obj = self.rt.lookup(&self.ctx, &path).map_err(|e| e.at_opt(pos.as_ref()))?;
                Ok(located(obj, &pos))
            }
            Opcode::Inc | Opcode::Dec => {
                let path = self.cursor.read_path()?;
                let pos = self.pos()?;
                let delta = if op == Opcode::Inc { 1 } else { -1 };
                self.rt.step(&self.ctx, &path, delta).map_err(|e| e.at_opt(pos.as_ref()))
            }
            Opcode::GetItem => {
                let path = self.cursor.read_path()?;
                let index = self.interpret()?;
                let pos = self.pos()?;
                let item = self.rt.get_item(&self.ctx, &path, &index).map_err(|e| e.at_opt(pos.as_ref()))?;
                Ok(located(item, &pos))
            }
            Opcode::VarAssign => {
                let path = self.cursor.read_path()?;
                let value = self.interpret()?;
                let pos = self.pos()?;
                self.rt.assign(&self.ctx, &path, &value).map_err(|e| e.at_opt(pos.as_ref()))
            }
            Opcode::SetItem => {
                let path = self.cursor.read_path()?;
                let index = self.interpret()?;
                let value = self.interpret()?;
                let pos = self.pos()?;
                self.rt.set_item(&self.ctx, &path, &index, &value).map_err(|e| e.at_opt(pos.as_ref()))
            }
            Opcode::UnOp => {
                let raw = self.cursor.read_u8()?;
                let unop = UnaryOp::from_byte(raw).ok_or_else(|| bad_bytecode(format!("Unknown unary operator {raw}")))?;
                let operand = self.interpret()?;
                let pos = self.pos()?;
                let result = object::ops::apply_unary_op(&self.rt.heap, &operand, unop).map_err(|e| e.at_opt(pos.as_ref()))?;
                Ok(located(result, &pos))
            }
            Opcode::BinOp => {
                let raw = self.cursor.read_u8()?;
                let binop = BinOp::from_byte(raw).ok_or_else(|| bad_bytecode(format!("Unknown binary operator {raw}")))?;
                let lhs = self.interpret()?;
                let rhs = self.interpret()?;
                let pos = self.pos()?;
                let result = object::ops::apply_binary_op(&self.rt.heap, &lhs, &rhs, binop).map_err(|e| e.at_opt(pos.as_ref()))?;
                Ok(located(result, &pos))
            }
            Opcode::VarNew | Opcode::VarUn => {
                let flags = self.cursor.read_u8()?;
                let ty = self.cursor.read_ident()?;
                let name = self.cursor.read_ident()?;
                let array = flags & DECL_ARRAY != 0;
                let size = if array { Some(self.interpret()?) } else { None };
                let value = if op == Opcode::VarNew { Some(self.interpret()?) } else { None };
                let pos = self.pos()?;
                let decl = DeclSpec { ty: TypeSpec { name: ty, pointer: flags & DECL_POINTER != 0 }, name, array };
                let obj = self
                    .rt
                    .declare(&self.ctx, &decl, size.as_ref(), value.as_ref())
                    .map_err(|e| e.at_opt(pos.as_ref()))?;
                Ok(located(obj, &pos))
            }
            Opcode::Call => {
                let callee = self.interpret()?;
                let argc = self.cursor.read_u32()?;
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    args.push(self.interpret()?);
                }
                let pos = self.pos()?;
                let result = self.rt.call(&self.ctx, &callee, &args).map_err(|e| e.at_opt(pos.as_ref()))?;
                Ok(located(result, &pos))
            }
            Opcode::FuncDec => {
                let ret = self.type_spec()?;
                let name = self.cursor.read_ident()?;
                let argc = self.cursor.read_u32()?;
                let mut params = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    let ty = self.type_spec()?;
                    let name = self.cursor.read_ident()?;
                    params.push(ParamSpec { ty, name });
                }
                let pos = self.pos()?;
                self.rt
                    .declare_function(&self.ctx, &ret, &name, &params, self.file.clone())
                    .map_err(|e| e.at_opt(pos.as_ref()))
            }
            Opcode::FuncDef => {
                let decl = self.interpret()?;
                let func = decl.function().ok_or_else(|| bad_bytecode("Function definition without a declaration"))?;
                let (count, start, end) = self.block_header()?;
                func.define(FuncBody::Bytecode { program: Rc::clone(self.cursor.program()), start, count });
                self.cursor.seek(end);
                self.pos()?;
                Ok(decl)
            }
            Opcode::If => {
                let file = self.file.clone();
                let cond = self.interpret()?;
                let taken = cond.is_truthy();
                let (count, _, end) = self.block_header()?;
                if taken {
                    self.block(count, end)?;
                } else {
                    self.cursor.seek(end);
                }
                if self.cursor.peek_u8() == Some(Opcode::Else.byte()) {
                    self.cursor.skip(1)?;
                    let (count, _, end) = self.block_header()?;
                    if taken {
                        self.cursor.seek(end);
                    } else {
                        self.block(count, end)?;
                    }
                }
                self.file = file;
                let pos = self.pos()?;
                let done = self.heap_int(0)?;
                Ok(located(done, &pos))
            }
            Opcode::While => self.while_loop(),
            Opcode::For => self.for_loop(),
            Opcode::Return => {
                let value = self.interpret()?;
                let pos = self.pos()?;
                self.rt.set_return(&self.ctx, &value).map_err(|e| e.at_opt(pos.as_ref()))?;
                Ok(value)
            }
            Opcode::Extern => {
                let globals = self.rt.globals().names();
                let saved = self.ctx.swap_names(globals);
                let result = self.interpret();
                self.ctx.swap_names(saved);
                result
            }
            Opcode::Const => {
                let inner = self.interpret()?;
                inner.mark_const();
                Ok(inner)
            }
            Opcode::Unsigned => {
                let inner = self.interpret()?;
                inner.mark_unsigned();
                Ok(inner)
            }
            Opcode::Struct => {
                let name = self.cursor.read_ident()?;
                let count = self.cursor.read_u32()?;
                let scope = self.rt.struct_scope(&name, self.file.clone());
                let outer = std::mem::replace(&mut self.ctx, Rc::clone(&scope));
                let members = self.statements(count);
                self.ctx = outer;
                members?;
                let pos = self.pos()?;
                self.rt.declare_struct(&self.ctx, &name, scope).map_err(|e| e.at_opt(pos.as_ref()))
            }
            Opcode::Typedef => {
                let base = self.type_spec()?;
                let name = self.cursor.read_ident()?;
                let pos = self.pos()?;
                self.rt.typedef(&base, &name).map_err(|e| e.at_opt(pos.as_ref()))
            }
            Opcode::Else => Err(bad_bytecode(format!("'else' without 'if' at offset {at}"))),
        }
    }

    /// Per completed iteration: cancellation check, then a heap sweep.
    fn end_iteration(&mut self, end: usize) -> MangoResult<()> {
        let pos = self.cursor.peek_pos_at(end, self.file.as_ref());
        self.rt.check_cancelled(pos.as_ref())?;
        self.rt.collect();
        Ok(())
    }

    fn while_loop(&mut self) -> MangoResult<ObjRef> {
        let top = self.cursor.position();
        let file = self.file.clone();
        loop {
            self.cursor.seek(top);
            self.file = file.clone();
            let cond = self.interpret()?;
            let (count, _, end) = self.block_header()?;
            if !cond.is_truthy() {
                self.cursor.seek(end);
                break;
            }
            self.block(count, end)?;
            if self.ctx.has_return() {
                break;
            }
            self.file = file.clone();
            self.end_iteration(end)?;
        }
        self.file = file;
        self.pos()?;
        self.heap_int(0)
    }

    fn for_loop(&mut self) -> MangoResult<ObjRef> {
        self.interpret()?;
        let top = self.cursor.position();
        let file = self.file.clone();
        loop {
            self.cursor.seek(top);
            self.file = file.clone();
            let cond = self.interpret()?;
            let (count, _, end) = self.block_header()?;
            if !cond.is_truthy() {
                self.cursor.seek(end);
                break;
            }
            self.statements(count)?;
            if self.ctx.has_return() {
                self.cursor.seek(end);
                break;
            }
            self.interpret()?;
            self.file = file.clone();
            self.end_iteration(end)?;
        }
        self.file = file;
        self.pos()?;
        self.heap_int(0)
    }
}

fn located(obj: ObjRef, pos: &Option<SourcePos>) -> ObjRef {
    if let Some(pos) = pos {
        obj.set_pos(pos);
    }
    obj
}
