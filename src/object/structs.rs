use std::rc::{Rc, Weak};

use crate::error::MangoResult;
use crate::names::{Context, NameTable, ScopeKind};

use super::{Heap, ObjRef, Object, Payload, TypeTag};

/// Name-table access shared by struct templates and instances.
pub trait StructLike {
    fn struct_name(&self) -> &str;
    fn scope(&self) -> &Rc<Context>;

    fn member(&self, name: &str) -> Option<ObjRef> {
        self.scope().names().get_local(name)
    }
}

/// A declared struct shape; its scope holds the member defaults.
pub struct StructTemplate {
    pub name: Rc<str>,
    pub scope: Rc<Context>,
}

/// A live struct value with its own independently counted members.
pub struct StructInstance {
    pub name: Rc<str>,
    pub scope: Rc<Context>,
    pub template: Weak<Object>,
}

impl StructLike for StructTemplate {
    fn struct_name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> &Rc<Context> {
        &self.scope
    }
}

impl StructLike for StructInstance {
    fn struct_name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> &Rc<Context> {
        &self.scope
    }
}

/// Wraps an already populated struct context as a template object.
pub fn new_template(heap: &Heap, name: &str, scope: Rc<Context>) -> MangoResult<ObjRef> {
    heap.allocate(TypeTag::STRUCT, Payload::StructTemplate(StructTemplate { name: Rc::from(name), scope }))
}

/// Creates an instance of a template (or copies an instance) with cloned members.
pub fn instantiate(heap: &Heap, source: &ObjRef) -> MangoResult<ObjRef> {
    let (name, scope, template) = {
        let payload = source.payload();
        match &*payload {
            Payload::StructTemplate(t) => (Rc::clone(&t.name), Rc::clone(&t.scope), Rc::downgrade(source)),
            Payload::StructInstance(i) => (Rc::clone(&i.name), Rc::clone(&i.scope), i.template.clone()),
            _ => return Err(crate::error::MangoError::illegal(format!("'{}' is not a struct", source))),
        }
    };
    let members = copy_members(heap, &scope.names())?;
    let ctx = Context::new(ScopeKind::Struct, scope.file(), &name, members);
    let instance = heap.allocate(TypeTag::STRUCT, Payload::StructInstance(StructInstance { name, scope: ctx, template }))?;
    if let Some(pos) = source.pos() {
        instance.set_pos(&pos);
    }
    Ok(instance)
}

/// Fresh parentless table holding clones of every member of `table`.
fn copy_members(heap: &Heap, table: &NameTable) -> MangoResult<Rc<NameTable>> {
    let copy = NameTable::new();
    for (name, value) in table.entries() {
        let cloned = if matches!(*value.payload(), Payload::StructInstance(_)) {
            instantiate(heap, &value)?
        } else {
            heap.clone_object(&value)?
        };
        copy.set(&name, cloned);
    }
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ArrayData;

    fn template_with_members(heap: &Heap) -> ObjRef {
        let scope = Context::new(ScopeKind::Struct, None, "point", NameTable::new());
        let x = heap.int(3).unwrap();
        let arr = heap.allocate(TypeTag::CHR.array(), Payload::Array(ArrayData::from_bytes(b"p\0"))).unwrap();
        let label = heap.pointer(TypeTag::CHR.pointer(), Some(arr)).unwrap();
        scope.names().set("x", x);
        scope.names().set("label", label);
        new_template(heap, "point", scope).unwrap()
    }

    #[test]
    fn instance_members_are_independent() {
        let heap = Heap::new();
        let tmpl = template_with_members(&heap);
        let inst = instantiate(&heap, &tmpl).unwrap();

        let inst_x = inst.payload().as_struct().unwrap().member("x").unwrap();
        let tmpl_x = tmpl.payload().as_struct().unwrap().member("x").unwrap();
        assert!(!Rc::ptr_eq(&inst_x, &tmpl_x));
        assert!(inst_x.is_copied());
        assert_eq!(inst_x.refcount(), 1);

        *inst_x.payload_mut() = Payload::Int(99);
        assert_eq!(tmpl_x.as_int(), Some(3));
    }

    #[test]
    fn pointer_members_retain_pointee_again() {
        let heap = Heap::new();
        let tmpl = template_with_members(&heap);
        let label = tmpl.payload().as_struct().unwrap().member("label").unwrap();
        let target = label.pointee().unwrap();
        assert_eq!(target.refcount(), 1);
        let _inst = instantiate(&heap, &tmpl).unwrap();
        assert_eq!(target.refcount(), 2);
    }

    #[test]
    fn instance_remembers_template() {
        let heap = Heap::new();
        let tmpl = template_with_members(&heap);
        let inst = instantiate(&heap, &tmpl).unwrap();
        let payload = inst.payload();
        let Payload::StructInstance(i) = &*payload else { panic!("not an instance") };
        assert!(Rc::ptr_eq(&i.template.upgrade().unwrap(), &tmpl));
        assert_eq!(i.struct_name(), "point");
    }
}
