use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::object::{self, ObjRef};

// ── Name table ──────────────────────────────────────────────────────

/// Ordered name → object mapping with an optional enclosing scope.
///
/// Binding a value retains it (and a pointer's target); replacing or
/// removing a binding releases the previous value the same way.
#[derive(Default)]
pub struct NameTable {
    entries: RefCell<Vec<(Rc<str>, ObjRef)>>,
    parent: RefCell<Option<Rc<NameTable>>>,
}

impl NameTable {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn with_parent(parent: Rc<NameTable>) -> Rc<Self> {
        let table = Self::new();
        table.set_parent(Some(parent));
        table
    }

    pub fn parent(&self) -> Option<Rc<NameTable>> {
        self.parent.borrow().clone()
    }

    pub fn set_parent(&self, parent: Option<Rc<NameTable>>) {
        *self.parent.borrow_mut() = parent;
    }

    /// Local lookup, then each enclosing scope in turn.
    pub fn get(&self, name: &str) -> Option<ObjRef> {
        if let Some(found) = self.get_local(name) {
            return Some(found);
        }
        let mut scope = self.parent();
        while let Some(table) = scope {
            if let Some(found) = table.get_local(name) {
                return Some(found);
            }
            scope = table.parent();
        }
        None
    }

    /// Lookup that never falls back to a parent scope.
    pub fn get_local(&self, name: &str) -> Option<ObjRef> {
        self.entries.borrow().iter().find(|(n, _)| &**n == name).map(|(_, o)| Rc::clone(o))
    }

    pub fn contains_local(&self, name: &str) -> bool {
        self.entries.borrow().iter().any(|(n, _)| &**n == name)
    }

    pub fn set(&self, name: &str, value: ObjRef) {
        object::retain(Some(&value));
        let previous = {
            let mut entries = self.entries.borrow_mut();
            match entries.iter_mut().find(|(n, _)| &**n == name) {
                Some((_, slot)) => Some(std::mem::replace(slot, value)),
                None => {
                    entries.push((Rc::from(name), value));
                    None
                }
            }
        };
        object::release(previous.as_ref());
    }

    /// Rebinds `name` in the nearest scope that already defines it.
    /// Returns false when no scope does.
    pub fn assign(&self, name: &str, value: ObjRef) -> bool {
        if self.contains_local(name) {
            self.set(name, value);
            return true;
        }
        let mut scope = self.parent();
        while let Some(table) = scope {
            if table.contains_local(name) {
                table.set(name, value);
                return true;
            }
            scope = table.parent();
        }
        false
    }

    pub fn remove(&self, name: &str) -> Option<ObjRef> {
        let removed = {
            let mut entries = self.entries.borrow_mut();
            let idx = entries.iter().position(|(n, _)| &**n == name)?;
            entries.remove(idx).1
        };
        object::release(Some(&removed));
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Snapshot of the local bindings in insertion order.
    pub fn entries(&self) -> Vec<(Rc<str>, ObjRef)> {
        self.entries.borrow().clone()
    }

    /// Drops every local binding, releasing each value.
    pub fn release_all(&self) {
        let entries = std::mem::take(&mut *self.entries.borrow_mut());
        for (_, value) in &entries {
            object::release(Some(value));
        }
    }
}

impl fmt::Debug for NameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.entries.borrow().iter().map(|(n, _)| n.to_string()).collect();
        f.debug_struct("NameTable")
            .field("names", &names)
            .field("has_parent", &self.parent.borrow().is_some())
            .finish()
    }
}

// ── Execution context ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Main,
    Function,
    Struct,
}

pub struct Context {
    kind: ScopeKind,
    file: RefCell<Option<Rc<str>>>,
    scope_name: Rc<str>,
    names: RefCell<Rc<NameTable>>,
    ret: RefCell<Option<ObjRef>>,
}

impl Context {
    pub fn new(kind: ScopeKind, file: Option<Rc<str>>, scope_name: &str, names: Rc<NameTable>) -> Rc<Self> {
        Rc::new(Context {
            kind,
            file: RefCell::new(file),
            scope_name: Rc::from(scope_name),
            names: RefCell::new(names),
            ret: RefCell::new(None),
        })
    }

    pub fn main(file: Option<Rc<str>>) -> Rc<Self> {
        Self::new(ScopeKind::Main, file, "<main>", NameTable::new())
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn file(&self) -> Option<Rc<str>> {
        self.file.borrow().clone()
    }

    pub fn names(&self) -> Rc<NameTable> {
        Rc::clone(&self.names.borrow())
    }

    /// Installs `names` as the active table and hands back the previous one.
    pub fn swap_names(&self, names: Rc<NameTable>) -> Rc<NameTable> {
        std::mem::replace(&mut *self.names.borrow_mut(), names)
    }

    pub fn set_return(&self, value: ObjRef) {
        *self.ret.borrow_mut() = Some(value);
    }

    pub fn has_return(&self) -> bool {
        self.ret.borrow().is_some()
    }

    pub fn take_return(&self) -> Option<ObjRef> {
        self.ret.borrow_mut().take()
    }

    /// Ends the context: releases every binding it holds.
    pub fn dispose(&self) {
        self.names().release_all();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.kind)
            .field("scope", &self.scope_name)
            .field("file", &self.file.borrow())
            .finish()
    }
}
