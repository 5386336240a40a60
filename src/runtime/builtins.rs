use std::rc::Rc;

use crate::error::{ErrorCode, MangoError, MangoResult};
use crate::names::Context;
use crate::object::{ArrayItems, BuiltinFn, Function, ObjRef, Payload, TypeTag};

use super::Runtime;

const STR: TypeTag = TypeTag::CHR.pointer();

type Signature = (&'static str, &'static [(&'static str, TypeTag)], TypeTag, BuiltinFn);

const BUILTINS: &[Signature] = &[
    ("write", &[("fd", TypeTag::INT), ("buf", STR), ("n", TypeTag::INT)], TypeTag::INT, write),
    ("read", &[("fd", TypeTag::INT), ("buf", STR), ("n", TypeTag::INT)], TypeTag::INT, read),
    ("dlopen", &[("path", STR)], TypeTag::INT, dlopen),
    ("dlsym", &[("handle", TypeTag::INT), ("name", STR)], TypeTag::INT, dlsym),
    ("dlclose", &[("handle", TypeTag::INT)], TypeTag::INT, dlclose),
];

pub(super) fn install(rt: &mut Runtime) -> MangoResult<()> {
    let names = rt.globals().names();
    names.set("true", rt.heap.int(1)?);
    names.set("false", rt.heap.int(0)?);
    names.set("null", rt.heap.int(0)?);
    names.set("nullchar", rt.heap.chr(0)?);
    for &(name, params, ret, f) in BUILTINS {
        names.set(name, rt.heap.function(Function::builtin(name, params, ret, f))?);
    }
    Ok(())
}

/// The chr array behind a `*chr` argument.
fn char_buffer(arg: &ObjRef) -> MangoResult<ObjRef> {
    let target = arg
        .pointee()
        .ok_or_else(|| MangoError::runtime(ErrorCode::InvalidPointer, "Null pointer passed as buffer"))?;
    if !matches!(&*target.payload(), Payload::Array(a) if matches!(a.items, ArrayItems::Char(_))) {
        return Err(MangoError::runtime(ErrorCode::InvalidType, "Buffer must be a chr array"));
    }
    Ok(target)
}

fn int_arg(arg: &ObjRef) -> i32 {
    arg.as_int().unwrap_or_default()
}

fn text_arg(arg: &ObjRef) -> MangoResult<String> {
    arg.string_bytes()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .ok_or_else(|| MangoError::runtime(ErrorCode::InvalidType, "Expected a string"))
}

fn write(rt: &mut Runtime, _ctx: &Rc<Context>, args: &[ObjRef]) -> MangoResult<ObjRef> {
    let fd = int_arg(&args[0]);
    let limit = usize::try_from(int_arg(&args[2])).unwrap_or(0);
    let buffer = char_buffer(&args[1])?;
    let bytes = match &*buffer.payload() {
        Payload::Array(data) => match &data.items {
            ArrayItems::Char(v) => v[..limit.min(v.len())].to_vec(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    let written = rt.io.write(fd, &bytes)?;
    rt.heap.int(written as i32)
}

fn read(rt: &mut Runtime, _ctx: &Rc<Context>, args: &[ObjRef]) -> MangoResult<ObjRef> {
    let fd = int_arg(&args[0]);
    let limit = usize::try_from(int_arg(&args[2])).unwrap_or(0);
    let buffer = char_buffer(&args[1])?;
    let mut payload = buffer.payload_mut();
    let count = match &mut *payload {
        Payload::Array(data) => match &mut data.items {
            ArrayItems::Char(v) => {
                let n = limit.min(v.len());
                rt.io.read(fd, &mut v[..n])?
            }
            _ => 0,
        },
        _ => 0,
    };
    drop(payload);
    rt.heap.int(count as i32)
}

fn dlopen(rt: &mut Runtime, _ctx: &Rc<Context>, args: &[ObjRef]) -> MangoResult<ObjRef> {
    let path = text_arg(&args[0])?;
    let index = rt.extensions.open(&rt.heap, &path)?;
    rt.heap.int(index as i32)
}

fn dlsym(rt: &mut Runtime, _ctx: &Rc<Context>, args: &[ObjRef]) -> MangoResult<ObjRef> {
    rt.extensions.symbol(&args[0], &args[1])
}

fn dlclose(rt: &mut Runtime, _ctx: &Rc<Context>, args: &[ObjRef]) -> MangoResult<ObjRef> {
    let status = rt.extensions.close(&args[0])?;
    rt.heap.int(status)
}
