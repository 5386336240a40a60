use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::dynload::Extension;
use crate::error::SourcePos;
use crate::names::Context;

pub mod function;
pub mod heap;
pub mod ops;
pub mod structs;

pub use function::{BuiltinFn, FuncBody, Function, Param};
pub use heap::Heap;
pub use structs::{StructInstance, StructLike, StructTemplate};

pub type ObjRef = Rc<Object>;

// ── Type tags ───────────────────────────────────────────────────────

/// Base kind in the low two bits, orthogonal flags above.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(u8);

impl TypeTag {
    pub const INT: TypeTag = TypeTag(0);
    pub const CHR: TypeTag = TypeTag(1);
    pub const FUNC: TypeTag = TypeTag(2);
    pub const STRUCT: TypeTag = TypeTag(3);

    pub const ARRAY: u8 = 1 << 2;
    pub const POINTER: u8 = 1 << 3;
    pub const TYPE: u8 = 1 << 4;
    pub const DYNLIB: u8 = 1 << 5;

    pub const fn from_bits(bits: u8) -> Self {
        TypeTag(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn base(self) -> TypeTag {
        TypeTag(self.0 & 0b11)
    }

    pub const fn is_array(self) -> bool {
        self.0 & Self::ARRAY != 0
    }

    pub const fn is_pointer(self) -> bool {
        self.0 & Self::POINTER != 0
    }

    pub const fn is_type(self) -> bool {
        self.0 & Self::TYPE != 0
    }

    pub const fn is_dynlib(self) -> bool {
        self.0 & Self::DYNLIB != 0
    }

    /// Plain Int or Char, no flags.
    pub const fn is_scalar(self) -> bool {
        self.0 == Self::INT.0 || self.0 == Self::CHR.0
    }

    pub const fn pointer(self) -> TypeTag {
        TypeTag(self.0 | Self::POINTER)
    }

    pub const fn array(self) -> TypeTag {
        TypeTag(self.0 | Self::ARRAY)
    }

    /// Byte width of one element when this tag is an array element type.
    pub fn element_size(self) -> usize {
        if self.is_pointer() {
            return std::mem::size_of::<usize>();
        }
        match self.base() {
            TypeTag::INT => 4,
            TypeTag::CHR => 1,
            _ => std::mem::size_of::<usize>(),
        }
    }

    pub fn base_name(self) -> &'static str {
        match self.base() {
            TypeTag::INT => "int",
            TypeTag::CHR => "chr",
            TypeTag::FUNC => "fun",
            _ => "struct",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dynlib() {
            return f.write_str("dynlib");
        }
        if self.is_type() {
            write!(f, "type ")?;
        }
        if self.is_pointer() {
            f.write_str("*")?;
        }
        f.write_str(self.base_name())?;
        if self.is_array() {
            f.write_str("[]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({self} = {:#04x})", self.0)
    }
}

// ── Payloads ────────────────────────────────────────────────────────

pub enum ArrayItems {
    Int(Vec<i32>),
    Char(Vec<u8>),
    Ptr(Vec<Option<ObjRef>>),
}

pub struct ArrayData {
    pub elem: TypeTag,
    pub items: ArrayItems,
}

impl ArrayData {
    pub fn zeroed(elem: TypeTag, len: usize) -> Self {
        let items = if elem.is_pointer() {
            ArrayItems::Ptr(vec![None; len])
        } else if elem.base() == TypeTag::CHR {
            ArrayItems::Char(vec![0; len])
        } else {
            ArrayItems::Int(vec![0; len])
        };
        ArrayData { elem, items }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        ArrayData { elem: TypeTag::CHR, items: ArrayItems::Char(bytes.to_vec()) }
    }

    pub fn len(&self) -> usize {
        match &self.items {
            ArrayItems::Int(v) => v.len(),
            ArrayItems::Char(v) => v.len(),
            ArrayItems::Ptr(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_size(&self) -> usize {
        self.elem.element_size()
    }

    /// Bytes up to (not including) the first NUL, for chr arrays.
    pub fn c_string(&self) -> Option<&[u8]> {
        match &self.items {
            ArrayItems::Char(v) => {
                let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
                Some(&v[..end])
            }
            _ => None,
        }
    }
}

impl Clone for ArrayData {
    fn clone(&self) -> Self {
        let items = match &self.items {
            ArrayItems::Int(v) => ArrayItems::Int(v.clone()),
            ArrayItems::Char(v) => ArrayItems::Char(v.clone()),
            ArrayItems::Ptr(v) => ArrayItems::Ptr(v.clone()),
        };
        ArrayData { elem: self.elem, items }
    }
}

/// Entry of the type registry, also a first-class object (`TYPE` flag).
#[derive(Clone)]
pub struct TypeDescriptor {
    pub name: Rc<str>,
    pub tag: TypeTag,
    pub template: Option<ObjRef>,
}

pub enum Payload {
    Int(i32),
    Char(u8),
    Array(ArrayData),
    Pointer(Option<ObjRef>),
    Function(Rc<Function>),
    StructTemplate(StructTemplate),
    StructInstance(StructInstance),
    Type(TypeDescriptor),
    DynLib(Rc<RefCell<Extension>>),
    /// Left behind by heap teardown.
    Freed,
}

impl Payload {
    pub fn as_struct(&self) -> Option<&dyn StructLike> {
        match self {
            Payload::StructTemplate(t) => Some(t),
            Payload::StructInstance(i) => Some(i),
            _ => None,
        }
    }

    fn footprint(&self) -> usize {
        match self {
            Payload::Int(_) => 4,
            Payload::Char(_) => 1,
            Payload::Array(a) => a.len() * a.element_size(),
            Payload::Pointer(_) => std::mem::size_of::<usize>(),
            _ => std::mem::size_of::<Payload>(),
        }
    }
}

// ── Object ──────────────────────────────────────────────────────────

/// The universal runtime value.
///
/// `refcount` counts bindings held by name tables, arrays, and the type
/// registry; it drives the heap's collect sweep. Memory itself is owned
/// through `Rc`, so a swept object that Rust code still holds stays valid.
pub struct Object {
    tag: TypeTag,
    refcount: Cell<u32>,
    size: usize,
    pos: RefCell<Option<SourcePos>>,
    copied: Cell<bool>,
    constant: Cell<bool>,
    unsigned: Cell<bool>,
    payload: RefCell<Payload>,
}

impl Object {
    pub(crate) fn new(tag: TypeTag, payload: Payload) -> Self {
        Object {
            tag,
            refcount: Cell::new(0),
            size: payload.footprint(),
            pos: RefCell::new(None),
            copied: Cell::new(false),
            constant: Cell::new(false),
            unsigned: Cell::new(false),
            payload: RefCell::new(payload),
        }
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    pub fn retain(&self) {
        self.refcount.set(self.refcount.get().saturating_add(1));
    }

    /// Never goes below zero.
    pub fn release(&self) {
        let n = self.refcount.get();
        if n > 0 {
            self.refcount.set(n - 1);
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pos(&self) -> Option<SourcePos> {
        self.pos.borrow().clone()
    }

    pub fn set_pos(&self, pos: &SourcePos) {
        *self.pos.borrow_mut() = Some(pos.clone());
    }

    pub fn is_copied(&self) -> bool {
        self.copied.get()
    }

    pub fn is_const(&self) -> bool {
        self.constant.get()
    }

    pub fn mark_const(&self) {
        self.constant.set(true);
    }

    pub fn is_unsigned(&self) -> bool {
        self.unsigned.get()
    }

    pub fn mark_unsigned(&self) {
        self.unsigned.set(true);
    }

    pub fn payload(&self) -> Ref<'_, Payload> {
        self.payload.borrow()
    }

    pub fn payload_mut(&self) -> RefMut<'_, Payload> {
        self.payload.borrow_mut()
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self.payload.borrow() {
            Payload::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<u8> {
        match *self.payload.borrow() {
            Payload::Char(c) => Some(c),
            _ => None,
        }
    }

    /// Int or Char value widened to `i32`.
    pub fn scalar(&self) -> Option<i32> {
        match *self.payload.borrow() {
            Payload::Int(v) => Some(v),
            Payload::Char(c) => Some(c as i32),
            _ => None,
        }
    }

    pub fn pointee(&self) -> Option<ObjRef> {
        match &*self.payload.borrow() {
            Payload::Pointer(target) => target.clone(),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<Rc<Function>> {
        match &*self.payload.borrow() {
            Payload::Function(f) => Some(Rc::clone(f)),
            _ => None,
        }
    }

    pub fn struct_scope(&self) -> Option<Rc<Context>> {
        self.payload.borrow().as_struct().map(|s| Rc::clone(s.scope()))
    }

    pub fn is_truthy(&self) -> bool {
        match &*self.payload.borrow() {
            Payload::Int(v) => *v != 0,
            Payload::Char(c) => *c != 0,
            Payload::Pointer(target) => target.is_some(),
            _ => true,
        }
    }

    /// Bytes of a chr array, or of the chr array behind a pointer.
    pub fn string_bytes(&self) -> Option<Vec<u8>> {
        if let Some(target) = self.pointee() {
            return target.string_bytes();
        }
        match &*self.payload.borrow() {
            Payload::Array(a) => a.c_string().map(<[u8]>::to_vec),
            _ => None,
        }
    }
}

/// Bumps the count of `obj` and, for pointers, of the pointee too.
pub fn retain(obj: Option<&ObjRef>) {
    let Some(obj) = obj else { return };
    obj.retain();
    if obj.tag().is_pointer() {
        if let Some(target) = obj.pointee() {
            target.retain();
        }
    }
}

/// Inverse of [`retain`]; a no-op on `None` and never underflows.
pub fn release(obj: Option<&ObjRef>) {
    let Some(obj) = obj else { return };
    obj.release();
    if obj.tag().is_pointer() {
        if let Some(target) = obj.pointee() {
            target.release();
        }
    }
}

/// Structural equality used to compare results of two evaluation strategies.
pub fn same_value(a: &ObjRef, b: &ObjRef) -> bool {
    same_value_depth(a, b, 8)
}

fn same_value_depth(a: &ObjRef, b: &ObjRef, depth: usize) -> bool {
    if Rc::ptr_eq(a, b) {
        return true;
    }
    if a.tag() != b.tag() || depth == 0 {
        return false;
    }
    let (pa, pb) = (a.payload(), b.payload());
    match (&*pa, &*pb) {
        (Payload::Int(x), Payload::Int(y)) => x == y,
        (Payload::Char(x), Payload::Char(y)) => x == y,
        (Payload::Array(x), Payload::Array(y)) => match (&x.items, &y.items) {
            (ArrayItems::Int(u), ArrayItems::Int(v)) => u == v,
            (ArrayItems::Char(u), ArrayItems::Char(v)) => u == v,
            (ArrayItems::Ptr(u), ArrayItems::Ptr(v)) => {
                u.len() == v.len()
                    && u.iter().zip(v).all(|pair| match pair {
                        (Some(p), Some(q)) => same_value_depth(p, q, depth - 1),
                        (None, None) => true,
                        _ => false,
                    })
            }
            _ => false,
        },
        (Payload::Pointer(x), Payload::Pointer(y)) => match (x, y) {
            (Some(p), Some(q)) => same_value_depth(p, q, depth - 1),
            (None, None) => true,
            _ => false,
        },
        (Payload::Function(f), Payload::Function(g)) => f.name == g.name && f.params.len() == g.params.len(),
        (Payload::Type(x), Payload::Type(y)) => x.name == y.name && x.tag == y.tag,
        _ => match (pa.as_struct(), pb.as_struct()) {
            (Some(s), Some(t)) => {
                let (m, n) = (s.scope().names().entries(), t.scope().names().entries());
                s.struct_name() == t.struct_name()
                    && m.len() == n.len()
                    && m.iter().zip(&n).all(|((k1, v1), (k2, v2))| k1 == k2 && same_value_depth(v1, v2, depth - 1))
            }
            _ => false,
        },
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.payload.borrow() {
            Payload::Int(v) if self.is_unsigned() => write!(f, "{}", *v as u32),
            Payload::Int(v) => write!(f, "{v}"),
            Payload::Char(c) => write!(f, "'{}'", (*c as char).escape_default()),
            Payload::Array(a) => match a.c_string() {
                Some(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes).escape_default()),
                None => write!(f, "<{} array of {}>", a.elem, a.len()),
            },
            Payload::Pointer(Some(target)) => write!(f, "&{target}"),
            Payload::Pointer(None) => f.write_str("null"),
            Payload::Function(func) => write!(f, "<fun {}>", func.name),
            Payload::StructTemplate(t) => write!(f, "<struct {}>", t.struct_name()),
            Payload::StructInstance(i) => write!(f, "<{} instance>", i.struct_name()),
            Payload::Type(t) => write!(f, "<type {}>", t.name),
            Payload::DynLib(ext) => write!(f, "<dynlib {}>", ext.borrow().path()),
            Payload::Freed => f.write_str("<freed>"),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("tag", &self.tag)
            .field("refcount", &self.refcount.get())
            .field("value", &format_args!("{self}"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_flags() {
        let s = TypeTag::CHR.pointer();
        assert!(s.is_pointer());
        assert_eq!(s.base(), TypeTag::CHR);
        assert_eq!(s.bits(), 0x09);
        assert_eq!(s.to_string(), "*chr");
        assert_eq!(TypeTag::INT.array().to_string(), "int[]");
        assert!(TypeTag::INT.is_scalar());
        assert!(!s.is_scalar());
    }

    #[test]
    fn element_sizes() {
        assert_eq!(TypeTag::INT.element_size(), 4);
        assert_eq!(TypeTag::CHR.element_size(), 1);
        assert_eq!(TypeTag::INT.pointer().element_size(), std::mem::size_of::<usize>());
    }

    #[test]
    fn retain_release_pairs_are_idempotent() {
        let o: ObjRef = Rc::new(Object::new(TypeTag::INT, Payload::Int(1)));
        for _ in 0..3 {
            o.retain();
        }
        for _ in 0..3 {
            o.release();
        }
        assert_eq!(o.refcount(), 0);
        o.release();
        o.release();
        assert_eq!(o.refcount(), 0);
        retain(None);
        release(None);
    }

    #[test]
    fn pointer_binding_retains_pointee() {
        let target: ObjRef = Rc::new(Object::new(TypeTag::INT, Payload::Int(7)));
        let p: ObjRef = Rc::new(Object::new(TypeTag::INT.pointer(), Payload::Pointer(Some(Rc::clone(&target)))));
        retain(Some(&p));
        assert_eq!((p.refcount(), target.refcount()), (1, 1));
        release(Some(&p));
        assert_eq!((p.refcount(), target.refcount()), (0, 0));
    }

    #[test]
    fn truthiness() {
        assert!(!Object::new(TypeTag::INT, Payload::Int(0)).is_truthy());
        assert!(Object::new(TypeTag::INT, Payload::Int(-1)).is_truthy());
        assert!(!Object::new(TypeTag::INT.pointer(), Payload::Pointer(None)).is_truthy());
        assert!(!Object::new(TypeTag::CHR, Payload::Char(0)).is_truthy());
        assert!(Object::new(TypeTag::CHR, Payload::Char(b'a')).is_truthy());
    }

    #[test]
    fn string_bytes_stop_at_nul() {
        let arr: ObjRef = Rc::new(Object::new(TypeTag::CHR.array(), Payload::Array(ArrayData::from_bytes(b"hi\0"))));
        let p = Object::new(TypeTag::CHR.pointer(), Payload::Pointer(Some(arr)));
        assert_eq!(p.string_bytes().as_deref(), Some(&b"hi"[..]));
        assert_eq!(p.to_string(), "&\"hi\"");
    }
}
