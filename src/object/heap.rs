use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;

use crate::error::{ErrorCode, MangoError, MangoResult};

use super::{ArrayData, Function, ObjRef, Object, Payload, TypeDescriptor, TypeTag};

/// Global live-object list. Every object is registered here on allocation;
/// `collect` unregisters everything whose binding count dropped to zero.
#[derive(Debug, Default)]
pub struct Heap {
    live: RefCell<Vec<ObjRef>>,
    limit: Cell<Option<usize>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the number of live objects; allocation past the cap is a Memory error.
    pub fn with_limit(limit: usize) -> Self {
        let heap = Self::default();
        heap.limit.set(Some(limit));
        heap
    }

    pub fn allocate(&self, tag: TypeTag, payload: Payload) -> MangoResult<ObjRef> {
        if let Some(limit) = self.limit.get() {
            if self.live.borrow().len() >= limit {
                self.collect();
            }
            if self.live.borrow().len() >= limit {
                return Err(MangoError::runtime(ErrorCode::Memory, "Memory allocation error"));
            }
        }
        let obj = Rc::new(Object::new(tag, payload));
        self.live.borrow_mut().push(Rc::clone(&obj));
        Ok(obj)
    }

    pub fn int(&self, value: i32) -> MangoResult<ObjRef> {
        self.allocate(TypeTag::INT, Payload::Int(value))
    }

    pub fn chr(&self, value: u8) -> MangoResult<ObjRef> {
        self.allocate(TypeTag::CHR, Payload::Char(value))
    }

    /// Int or Char depending on `tag`'s base.
    pub fn scalar(&self, tag: TypeTag, value: i32) -> MangoResult<ObjRef> {
        if tag.base() == TypeTag::CHR {
            self.chr(value as u8)
        } else {
            self.int(value)
        }
    }

    pub fn pointer(&self, tag: TypeTag, target: Option<ObjRef>) -> MangoResult<ObjRef> {
        self.allocate(tag.pointer(), Payload::Pointer(target))
    }

    pub fn array(&self, elem: TypeTag, len: usize) -> MangoResult<ObjRef> {
        self.allocate(elem.base().array(), Payload::Array(ArrayData::zeroed(elem, len)))
    }

    /// A string value: pointer to a NUL-terminated chr array.
    pub fn string(&self, bytes: &[u8]) -> MangoResult<ObjRef> {
        let mut buf = Vec::with_capacity(bytes.len() + 1);
        buf.extend_from_slice(bytes);
        buf.push(0);
        let arr = self.allocate(TypeTag::CHR.array(), Payload::Array(ArrayData::from_bytes(&buf)))?;
        self.pointer(TypeTag::CHR, Some(arr))
    }

    pub fn function(&self, func: Function) -> MangoResult<ObjRef> {
        self.allocate(TypeTag::FUNC, Payload::Function(Rc::new(func)))
    }

    pub fn type_descriptor(&self, desc: TypeDescriptor) -> MangoResult<ObjRef> {
        let tag = TypeTag::from_bits(desc.tag.bits() | TypeTag::TYPE);
        self.allocate(tag, Payload::Type(desc))
    }

    /// Copies the payload into a fresh object with a zero count and the `copied` flag set.
    pub fn clone_object(&self, obj: &ObjRef) -> MangoResult<ObjRef> {
        let payload = match &*obj.payload() {
            Payload::Int(v) => Payload::Int(*v),
            Payload::Char(c) => Payload::Char(*c),
            Payload::Array(a) => Payload::Array(a.clone()),
            Payload::Pointer(t) => Payload::Pointer(t.clone()),
            Payload::Function(f) => Payload::Function(Rc::clone(f)),
            Payload::StructTemplate(t) => Payload::StructTemplate(super::StructTemplate {
                name: Rc::clone(&t.name),
                scope: Rc::clone(&t.scope),
            }),
            Payload::StructInstance(i) => Payload::StructInstance(super::StructInstance {
                name: Rc::clone(&i.name),
                scope: Rc::clone(&i.scope),
                template: i.template.clone(),
            }),
            Payload::Type(d) => Payload::Type(d.clone()),
            Payload::DynLib(ext) => Payload::DynLib(Rc::clone(ext)),
            Payload::Freed => Payload::Freed,
        };
        let copy = self.allocate(obj.tag(), payload)?;
        copy.copied.set(true);
        copy.unsigned.set(obj.is_unsigned());
        if let Some(pos) = obj.pos() {
            copy.set_pos(&pos);
        }
        Ok(copy)
    }

    /// Drops every unbound object from the live list; returns how many.
    pub fn collect(&self) -> usize {
        let mut live = self.live.borrow_mut();
        let before = live.len();
        live.retain(|o| o.refcount() > 0);
        let freed = before - live.len();
        if freed > 0 {
            trace!(freed, live = live.len(), "heap sweep");
        }
        freed
    }

    pub fn live_count(&self) -> usize {
        self.live.borrow().len()
    }

    /// Process-exit teardown: clears every payload (breaking reference cycles)
    /// without touching counts, then empties the list.
    pub fn teardown(&self) {
        let live = std::mem::take(&mut *self.live.borrow_mut());
        for obj in &live {
            if let Ok(mut payload) = obj.payload.try_borrow_mut() {
                *payload = Payload::Freed;
            }
        }
        trace!(count = live.len(), "heap teardown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_registers_objects() {
        let heap = Heap::new();
        let a = heap.int(1).unwrap();
        let _s = heap.string(b"abc").unwrap();
        assert_eq!(heap.live_count(), 3);
        assert_eq!(a.refcount(), 0);
        assert_eq!(a.size(), 4);
    }

    #[test]
    fn collect_keeps_bound_objects() {
        let heap = Heap::new();
        let kept = heap.int(1).unwrap();
        let _dropped = heap.int(2).unwrap();
        kept.retain();
        assert_eq!(heap.collect(), 1);
        assert_eq!(heap.live_count(), 1);
        assert_eq!(kept.as_int(), Some(1));
    }

    #[test]
    fn limit_triggers_memory_error() {
        let heap = Heap::with_limit(2);
        let a = heap.int(1).unwrap();
        let b = heap.int(2).unwrap();
        a.retain();
        b.retain();
        let err = heap.int(3).unwrap_err();
        assert_eq!(err.code, ErrorCode::Memory);
        b.release();
        assert!(heap.int(4).is_ok(), "sweep should make room");
    }

    #[test]
    fn clone_sets_copied_and_zero_count() {
        let heap = Heap::new();
        let a = heap.string(b"xy").unwrap();
        a.retain();
        let c = heap.clone_object(&a).unwrap();
        assert!(c.is_copied());
        assert_eq!(c.refcount(), 0);
        assert_eq!(c.tag(), TypeTag::CHR.pointer());
        assert!(Rc::ptr_eq(&c.pointee().unwrap(), &a.pointee().unwrap()));
    }

    #[test]
    fn array_sizes_follow_element_width() {
        let heap = Heap::new();
        assert_eq!(heap.array(TypeTag::INT, 5).unwrap().size(), 20);
        assert_eq!(heap.array(TypeTag::CHR, 5).unwrap().size(), 5);
    }

    #[test]
    fn teardown_empties_list() {
        let heap = Heap::new();
        let a = heap.int(5).unwrap();
        heap.teardown();
        assert_eq!(heap.live_count(), 0);
        assert!(matches!(*a.payload(), Payload::Freed));
    }
}
