use std::rc::Rc;

use tracing::debug;

use crate::ast::{DeclSpec, ParamSpec, TypeSpec};
use crate::error::{ErrorCode, MangoError, MangoResult};
use crate::names::{Context, NameTable, ScopeKind};
use crate::object::{self, structs, FuncBody, Function, ObjRef, Param, Payload, TypeTag};

use super::Runtime;

fn same_shape(expected: TypeTag, actual: TypeTag) -> bool {
    expected.base() == actual.base() && expected.is_pointer() == actual.is_pointer()
}

impl Runtime {
    // ── Bindings ────────────────────────────────────────────────────

    /// The object a binding should hold for `value`: values already bound
    /// elsewhere are copied so the two names stay independent.
    pub fn bind_copy(&self, value: &ObjRef) -> MangoResult<ObjRef> {
        if value.refcount() == 0 {
            return Ok(Rc::clone(value));
        }
        match &*value.payload() {
            Payload::Int(_) | Payload::Char(_) | Payload::Pointer(_) => {}
            Payload::StructInstance(_) => return structs::instantiate(&self.heap, value),
            _ => return Ok(Rc::clone(value)),
        }
        self.heap.clone_object(value)
    }

    /// `T name`, `T name[n]` and `T name = value` in the scope of `ctx`.
    pub fn declare(
        &self,
        ctx: &Context,
        decl: &DeclSpec,
        size: Option<&ObjRef>,
        value: Option<&ObjRef>,
    ) -> MangoResult<ObjRef> {
        let tag = self.types.resolve_type(&decl.ty.name, decl.ty.pointer)?;
        let obj = match value {
            Some(value) => {
                let expected = if decl.array { tag.pointer() } else { tag };
                if !same_shape(expected, value.tag()) {
                    return Err(MangoError::mismatched_types().at_opt(value.pos().as_ref()));
                }
                self.bind_copy(value)?
            }
            None => self.default_value(&decl.ty, tag, decl.array, size)?,
        };
        ctx.names().set(&decl.name, Rc::clone(&obj));
        Ok(obj)
    }

    fn default_value(&self, ty: &TypeSpec, tag: TypeTag, array: bool, size: Option<&ObjRef>) -> MangoResult<ObjRef> {
        if array {
            let len = match size {
                Some(size) if size.tag() == TypeTag::INT => size.as_int().unwrap_or_default(),
                _ => return Err(MangoError::runtime(ErrorCode::InvalidType, "Array size must be an integer")),
            };
            let len = usize::try_from(len).map_err(|_| {
                MangoError::runtime(ErrorCode::InvalidValue, format!("Invalid array size {len}"))
            })?;
            let items = self.heap.array(tag, len)?;
            return self.heap.pointer(tag, Some(items));
        }
        if tag.is_pointer() {
            return self.heap.pointer(tag, None);
        }
        match tag.base() {
            TypeTag::STRUCT => {
                let template = self.types.template(&ty.name).ok_or_else(|| {
                    MangoError::runtime(ErrorCode::InvalidType, format!("'{}' has no struct definition", ty.name))
                })?;
                structs::instantiate(&self.heap, &template)
            }
            TypeTag::FUNC => Err(MangoError::illegal(format!("Cannot declare a variable of type '{}'", ty.name))),
            _ => self.heap.scalar(tag, 0),
        }
    }

    // ── Paths ───────────────────────────────────────────────────────

    /// Resolves `a.b.c`: the head through the scope chain, each member in
    /// its struct's own table. Pointers to structs are followed.
    pub fn lookup(&self, ctx: &Context, path: &[String]) -> MangoResult<ObjRef> {
        let (head, rest) = path.split_first().ok_or_else(|| MangoError::internal("Empty name path"))?;
        let mut obj = ctx.names().get(head).ok_or_else(|| MangoError::undefined(head))?;
        for (i, member) in rest.iter().enumerate() {
            let table = self.member_table(&obj, &path[..=i])?;
            obj = table.get_local(member).ok_or_else(|| MangoError::undefined(&path[..i + 2].join(".")))?;
        }
        Ok(obj)
    }

    fn member_table(&self, holder: &ObjRef, path: &[String]) -> MangoResult<Rc<NameTable>> {
        let holder = if holder.tag().is_pointer() { object::ops::deref(holder)? } else { Rc::clone(holder) };
        holder
            .struct_scope()
            .map(|scope| scope.names())
            .ok_or_else(|| MangoError::illegal(format!("'{}' is not a struct", path.join("."))))
    }

    /// `path = value`. The stored object takes over the target's unsigned
    /// flag; const targets and differing tags are rejected.
    pub fn assign(&self, ctx: &Context, path: &[String], value: &ObjRef) -> MangoResult<ObjRef> {
        let current = self.lookup(ctx, path)?;
        if current.is_const() {
            return Err(MangoError::illegal("Assignment to constant"));
        }
        if current.tag() != value.tag() {
            return Err(MangoError::mismatched_types());
        }
        let stored = self.bind_copy(value)?;
        if current.is_unsigned() {
            stored.mark_unsigned();
        }
        match path.split_last() {
            Some((name, [])) => {
                ctx.names().assign(name, Rc::clone(&stored));
            }
            Some((name, holder)) => {
                let owner = self.lookup(ctx, holder)?;
                self.member_table(&owner, holder)?.set(name, Rc::clone(&stored));
            }
            None => return Err(MangoError::internal("Empty name path")),
        }
        Ok(stored)
    }

    pub fn get_item(&self, ctx: &Context, path: &[String], index: &ObjRef) -> MangoResult<ObjRef> {
        let target = self.lookup(ctx, path)?;
        object::ops::get_item(&self.heap, &target, index)
    }

    pub fn set_item(&self, ctx: &Context, path: &[String], index: &ObjRef, value: &ObjRef) -> MangoResult<ObjRef> {
        let target = self.lookup(ctx, path)?;
        object::ops::set_item(&target, index, value)?;
        Ok(Rc::clone(value))
    }

    /// `path++` / `path--`; yields the value before the step.
    pub fn step(&self, ctx: &Context, path: &[String], delta: i32) -> MangoResult<ObjRef> {
        let target = self.lookup(ctx, path)?;
        object::ops::step(&self.heap, &target, delta)
    }

    // ── Functions ───────────────────────────────────────────────────

    pub fn declare_function(
        &self,
        ctx: &Context,
        ret: &TypeSpec,
        name: &str,
        params: &[ParamSpec],
        file: Option<Rc<str>>,
    ) -> MangoResult<ObjRef> {
        let ret = self.types.resolve_type(&ret.name, ret.pointer)?;
        let params = params
            .iter()
            .map(|p| Ok(Param { name: p.name.clone(), tag: self.types.resolve_type(&p.ty.name, p.ty.pointer)? }))
            .collect::<MangoResult<Vec<_>>>()?;
        let func = self.heap.function(Function::new(name, params, ret, file))?;
        ctx.names().set(name, Rc::clone(&func));
        Ok(func)
    }

    /// Invokes `callee` with already evaluated arguments from `ctx`.
    ///
    /// The callee runs in a fresh function context whose table is parented
    /// on the caller's. Arguments not bound by the callee stay temporaries
    /// for the next sweep; the context is disposed on every path.
    pub fn call(&mut self, ctx: &Context, callee: &ObjRef, args: &[ObjRef]) -> MangoResult<ObjRef> {
        let func = callee
            .function()
            .ok_or_else(|| MangoError::illegal(format!("Value of type {} is not callable", callee.tag())))?;
        if args.len() != func.arg_count() {
            return Err(MangoError::illegal("Invalid number of arguments passed to function"));
        }
        for (param, arg) in func.params.iter().zip(args) {
            if param.tag != arg.tag() {
                return Err(MangoError::mismatched_types().at_opt(arg.pos().as_ref()));
            }
        }
        let body = func.body.borrow().clone();
        if matches!(body, FuncBody::Undefined) {
            return Err(MangoError::runtime(
                ErrorCode::UndefinedName,
                format!("Undefined reference to function '{}'", func.name),
            ));
        }

        self.enter_call()?;
        let fctx = Context::new(ScopeKind::Function, func.file.clone(), &func.name, NameTable::with_parent(ctx.names()));
        let result = self.run_body(&fctx, &func, body, args);
        fctx.dispose();
        self.leave_call();
        result
    }

    fn run_body(&mut self, fctx: &Rc<Context>, func: &Function, body: FuncBody, args: &[ObjRef]) -> MangoResult<ObjRef> {
        match body {
            FuncBody::Builtin(f) => return f(self, fctx, args),
            FuncBody::Foreign(foreign) => return crate::dynload::call_foreign(self, &foreign, fctx, args),
            FuncBody::Undefined => return Err(MangoError::internal("Function body vanished")),
            FuncBody::Bytecode { program, start, count } => {
                self.bind_params(fctx, func, args)?;
                crate::vm::call_body(self, fctx, program, start, count)?;
            }
            FuncBody::Ast(nodes) => {
                self.bind_params(fctx, func, args)?;
                crate::interpreter::call_body(self, fctx, &nodes)?;
            }
        }
        let Some(value) = fctx.take_return() else {
            return self.heap.int(0);
        };
        if value.tag() != func.ret {
            return Err(MangoError::mismatched_types().at_opt(value.pos().as_ref()));
        }
        Ok(value)
    }

    fn bind_params(&self, fctx: &Context, func: &Function, args: &[ObjRef]) -> MangoResult<()> {
        let names = fctx.names();
        for (param, arg) in func.params.iter().zip(args) {
            names.set(&param.name, self.bind_copy(arg)?);
        }
        Ok(())
    }

    pub fn set_return(&self, ctx: &Context, value: &ObjRef) -> MangoResult<()> {
        if ctx.kind() != ScopeKind::Function {
            return Err(MangoError::illegal("'return' outside of a function"));
        }
        ctx.set_return(Rc::clone(value));
        Ok(())
    }

    // ── Structs and types ───────────────────────────────────────────

    /// Fresh struct-kind context for a struct body; its table has no parent
    /// so member declarations never see enclosing names.
    pub fn struct_scope(&self, name: &str, file: Option<Rc<str>>) -> Rc<Context> {
        Context::new(ScopeKind::Struct, file, name, NameTable::new())
    }

    /// Wraps a populated struct body as a template, binds it in `outer` and
    /// registers it as a type.
    pub fn declare_struct(&mut self, outer: &Context, name: &str, scope: Rc<Context>) -> MangoResult<ObjRef> {
        let template = structs::new_template(&self.heap, name, scope)?;
        outer.names().set(name, Rc::clone(&template));
        self.types.register(&self.heap, name, TypeTag::STRUCT, Some(Rc::clone(&template)))?;
        debug!(name, "declared struct");
        Ok(template)
    }

    /// `typedef [*]old as new`; yields the new type descriptor.
    pub fn typedef(&mut self, base: &TypeSpec, name: &str) -> MangoResult<ObjRef> {
        let desc = self
            .types
            .lookup(&base.name)
            .ok_or_else(|| MangoError::runtime(ErrorCode::InvalidType, format!("Unknown type '{}'", base.name)))?;
        let tag = if base.pointer { desc.tag.pointer() } else { desc.tag };
        self.types.register(&self.heap, name, tag, desc.template)
    }
}
