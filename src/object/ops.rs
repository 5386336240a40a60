use std::rc::Rc;

use crate::ast::{BinOp, UnaryOp};
use crate::error::{ErrorCode, MangoError, MangoResult};

use super::{ArrayItems, Heap, ObjRef, Payload, TypeTag};

/// Arithmetic and comparison between Int/Char operands.
///
/// Mixed Int/Char yields Int; Char with Char stays Char for arithmetic.
/// Comparisons always yield Int 0/1. An unsigned left operand switches
/// division, modulo and ordering to `u32`.
pub fn apply_binary_op(heap: &Heap, lhs: &ObjRef, rhs: &ObjRef, op: BinOp) -> MangoResult<ObjRef> {
    let illegal = || {
        MangoError::illegal(format!("Illegal operation: {} {} {}", lhs.tag(), op.symbol(), rhs.tag()))
            .at_opt(lhs.pos().as_ref())
    };
    if !lhs.tag().is_scalar() || !rhs.tag().is_scalar() {
        return Err(illegal());
    }
    let (Some(a), Some(b)) = (lhs.scalar(), rhs.scalar()) else {
        return Err(illegal());
    };
    let unsigned = lhs.is_unsigned();
    let (ua, ub) = (a as u32, b as u32);

    let value = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div | BinOp::Mod if b == 0 => {
            return Err(MangoError::illegal("Division by zero").at_opt(lhs.pos().as_ref()));
        }
        BinOp::Div if unsigned => (ua / ub) as i32,
        BinOp::Div => a.wrapping_div(b),
        BinOp::Mod if unsigned => (ua % ub) as i32,
        BinOp::Mod => a.wrapping_rem(b),
        BinOp::Eq => (a == b) as i32,
        BinOp::Ne => (a != b) as i32,
        BinOp::Lt if unsigned => (ua < ub) as i32,
        BinOp::Lt => (a < b) as i32,
        BinOp::Gt if unsigned => (ua > ub) as i32,
        BinOp::Gt => (a > b) as i32,
        BinOp::Le if unsigned => (ua <= ub) as i32,
        BinOp::Le => (a <= b) as i32,
        BinOp::Ge if unsigned => (ua >= ub) as i32,
        BinOp::Ge => (a >= b) as i32,
    };

    let both_chars = lhs.tag() == TypeTag::CHR && rhs.tag() == TypeTag::CHR;
    let result = if both_chars && !op.is_comparison() {
        heap.chr(value as u8)?
    } else {
        heap.int(value)?
    };
    if unsigned && !op.is_comparison() {
        result.mark_unsigned();
    }
    Ok(result)
}

pub fn apply_unary_op(heap: &Heap, operand: &ObjRef, op: UnaryOp) -> MangoResult<ObjRef> {
    match op {
        UnaryOp::Neg => match operand.scalar() {
            Some(v) if operand.tag().is_scalar() => heap.scalar(operand.tag(), v.wrapping_neg()),
            _ => Err(MangoError::illegal(format!("Illegal operation: -{}", operand.tag())).at_opt(operand.pos().as_ref())),
        },
        UnaryOp::Plus => match operand.tag().is_scalar() {
            true => Ok(Rc::clone(operand)),
            false => Err(MangoError::illegal(format!("Illegal operation: +{}", operand.tag())).at_opt(operand.pos().as_ref())),
        },
        UnaryOp::AddressOf => heap.pointer(operand.tag().base(), Some(Rc::clone(operand))),
        UnaryOp::Deref => deref(operand),
    }
}

pub fn deref(obj: &ObjRef) -> MangoResult<ObjRef> {
    if !obj.tag().is_pointer() {
        return Err(MangoError::illegal("Attempt to dereference a non-pointer").at_opt(obj.pos().as_ref()));
    }
    obj.pointee()
        .ok_or_else(|| MangoError::runtime(ErrorCode::InvalidPointer, "Null pointer dereference").at_opt(obj.pos().as_ref()))
}

/// The array behind `obj`, following one level of pointer.
fn array_target(obj: &ObjRef) -> MangoResult<ObjRef> {
    let target = if obj.tag().is_pointer() { deref(obj)? } else { Rc::clone(obj) };
    if !matches!(*target.payload(), Payload::Array(_)) {
        return Err(MangoError::illegal(format!("Cannot index a value of type {}", obj.tag())));
    }
    Ok(target)
}

fn check_index(index: &ObjRef, len: usize) -> MangoResult<usize> {
    let i = match (index.tag(), index.scalar()) {
        (TypeTag::INT, Some(i)) => i,
        _ => return Err(MangoError::illegal("Index must be integer")),
    };
    if i < 0 || i as usize >= len {
        return Err(MangoError::illegal(format!("Index {i} out of range for array of length {len}")));
    }
    Ok(i as usize)
}

/// Reads one element into a fresh object.
pub fn get_item(heap: &Heap, target: &ObjRef, index: &ObjRef) -> MangoResult<ObjRef> {
    let array = array_target(target)?;
    let payload = array.payload();
    let Payload::Array(data) = &*payload else {
        return Err(MangoError::illegal("Cannot index a non-array"));
    };
    let i = check_index(index, data.len())?;
    match &data.items {
        ArrayItems::Int(v) => heap.int(v[i]),
        ArrayItems::Char(v) => heap.chr(v[i]),
        ArrayItems::Ptr(v) => heap.pointer(data.elem, v[i].clone()),
    }
}

/// Writes one element; the value must match the element type.
pub fn set_item(target: &ObjRef, index: &ObjRef, value: &ObjRef) -> MangoResult<()> {
    let array = array_target(target)?;
    if target.is_const() || array.is_const() {
        return Err(MangoError::illegal("Assignment to constant"));
    }
    let (len, elem) = match &*array.payload() {
        Payload::Array(data) => (data.len(), data.elem),
        _ => return Err(MangoError::illegal("Cannot index a non-array")),
    };
    let i = check_index(index, len)?;
    let scalar = if value.tag().is_scalar() { value.scalar() } else { None };
    let pointee = if value.tag() == elem.pointer() { Some(value.pointee()) } else { None };

    let mut payload = array.payload_mut();
    let Payload::Array(data) = &mut *payload else {
        return Err(MangoError::illegal("Cannot index a non-array"));
    };
    match (&mut data.items, scalar, pointee) {
        (ArrayItems::Int(v), Some(n), _) if value.tag() == TypeTag::INT => v[i] = n,
        (ArrayItems::Char(v), Some(n), _) => v[i] = n as u8,
        (ArrayItems::Ptr(v), _, Some(new)) => {
            if let Some(t) = &new {
                t.retain();
            }
            if let Some(old) = std::mem::replace(&mut v[i], new) {
                old.release();
            }
        }
        _ => return Err(MangoError::mismatched_types()),
    }
    Ok(())
}

/// `x++` / `x--`: mutates in place and returns the previous value.
pub fn step(heap: &Heap, target: &ObjRef, delta: i32) -> MangoResult<ObjRef> {
    if target.is_const() {
        return Err(MangoError::illegal("Assignment to constant").at_opt(target.pos().as_ref()));
    }
    let old = {
        let mut payload = target.payload_mut();
        match &mut *payload {
            Payload::Int(v) => {
                let old = *v;
                *v = v.wrapping_add(delta);
                old
            }
            Payload::Char(c) => {
                let old = *c as i32;
                *c = c.wrapping_add(delta as u8);
                old
            }
            _ => {
                return Err(MangoError::illegal(format!("Cannot increment a value of type {}", target.tag()))
                    .at_opt(target.pos().as_ref()));
            }
        }
    };
    heap.scalar(target.tag(), old)
}
