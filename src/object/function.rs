use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::Node;
use crate::bytecode::Program;
use crate::dynload::ForeignBuiltin;
use crate::error::MangoResult;
use crate::names::Context;
use crate::runtime::Runtime;

use super::{ObjRef, TypeTag};

/// Native builtin: receives the raw argument objects and the fresh call context.
pub type BuiltinFn = fn(&mut Runtime, &Rc<Context>, &[ObjRef]) -> MangoResult<ObjRef>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub tag: TypeTag,
}

#[derive(Clone)]
pub enum FuncBody {
    /// Declared but not yet defined.
    Undefined,
    /// A sub-range of a compiled program: `count` statements starting at `start`.
    Bytecode { program: Rc<Program>, start: usize, count: u32 },
    /// Statements evaluated directly by the reference interpreter.
    Ast(Rc<[Node]>),
    Builtin(BuiltinFn),
    Foreign(ForeignBuiltin),
}

pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: TypeTag,
    /// File the function was defined in; call frames report positions against it.
    pub file: Option<Rc<str>>,
    pub body: RefCell<FuncBody>,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret: TypeTag, file: Option<Rc<str>>) -> Self {
        Function { name: name.into(), params, ret, file, body: RefCell::new(FuncBody::Undefined) }
    }

    pub fn builtin(name: &str, params: &[(&str, TypeTag)], ret: TypeTag, f: BuiltinFn) -> Self {
        let params = params.iter().map(|(n, t)| Param { name: (*n).to_string(), tag: *t }).collect();
        Function { name: name.to_string(), params, ret, file: None, body: RefCell::new(FuncBody::Builtin(f)) }
    }

    pub fn arg_count(&self) -> usize {
        self.params.len()
    }

    pub fn is_defined(&self) -> bool {
        !matches!(*self.body.borrow(), FuncBody::Undefined)
    }

    pub fn is_native(&self) -> bool {
        matches!(*self.body.borrow(), FuncBody::Builtin(_) | FuncBody::Foreign(_))
    }

    pub fn define(&self, body: FuncBody) {
        *self.body.borrow_mut() = body;
    }

    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(|p| format!("{} {}", p.tag, p.name)).collect();
        format!("fun {} {}({})", self.ret, self.name, params.join(", "))
    }
}
