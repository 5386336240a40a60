//! Native extension loading.
//!
//! An extension is a shared object exporting
//! `int mangodl_init(const HostApi *api, uint32_t table)`. It never links
//! against the host: every operation goes through the [`HostApi`] vtable,
//! and objects cross the boundary as small integer handles that are valid
//! only for the duration of the foreign call that produced them.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr};
use std::rc::Rc;

use tracing::{info, warn};

use crate::error::{ErrorCode, ErrorKind, MangoError, MangoResult, SourcePos};
use crate::names::{Context, NameTable};
use crate::object::{FuncBody, Function, Heap, ObjRef, Param, Payload, TypeTag};
use crate::runtime::Runtime;

pub const HOST_API_VERSION: u32 = 1;
pub const INIT_SYMBOL: &[u8] = b"mangodl_init\0";

/// Opaque object or table reference handed to foreign code. Zero is null.
pub type Handle = u32;

pub type InitFn = unsafe extern "C" fn(api: *const HostApi, table: Handle) -> c_int;

/// Body of a builtin registered by an extension. Returns the result handle,
/// or zero after calling `error_set`.
pub type ForeignFn =
    unsafe extern "C" fn(api: *const HostApi, args: *const Handle, argc: u32, table: Handle) -> Handle;

/// Capability table passed to every foreign entry point.
#[repr(C)]
pub struct HostApi {
    pub version: u32,
    pub error_set: unsafe extern "C" fn(kind: u32, code: u32, message: *const c_char),
    pub error_set_pos: unsafe extern "C" fn(line: u32, column: u32, file: *const c_char),
    pub error_is_set: extern "C" fn() -> c_int,
    pub int_new: extern "C" fn(value: i32) -> Handle,
    pub char_new: extern "C" fn(value: c_char) -> Handle,
    pub array_new: extern "C" fn(elem_type: u8, len: u32) -> Handle,
    pub pointer_new: extern "C" fn(elem_type: u8, target: Handle) -> Handle,
    pub names_set: unsafe extern "C" fn(table: Handle, name: *const c_char, value: Handle) -> c_int,
    pub names_get: unsafe extern "C" fn(table: Handle, name: *const c_char) -> Handle,
    pub builtin_new: unsafe extern "C" fn(
        name: *const c_char,
        ret_type: u8,
        argc: u32,
        arg_types: *const u8,
        func: Option<ForeignFn>,
    ) -> Handle,
    pub int_value: extern "C" fn(value: Handle) -> i32,
    pub char_value: extern "C" fn(value: Handle) -> c_char,
    pub type_of: extern "C" fn(value: Handle) -> u8,
}

pub static HOST_API: HostApi = HostApi {
    version: HOST_API_VERSION,
    error_set: host_error_set,
    error_set_pos: host_error_set_pos,
    error_is_set: host_error_is_set,
    int_new: host_int_new,
    char_new: host_char_new,
    array_new: host_array_new,
    pointer_new: host_pointer_new,
    names_set: host_names_set,
    names_get: host_names_get,
    builtin_new: host_builtin_new,
    int_value: host_int_value,
    char_value: host_char_value,
    type_of: host_type_of,
};

// ── Extensions ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Extension {
    path: String,
    /// Held only to keep the image mapped while open.
    #[allow(dead_code)]
    library: Option<libloading::Library>,
    names: Rc<NameTable>,
    open: bool,
}

impl Extension {
    fn new(path: &str) -> Self {
        Extension { path: path.to_string(), library: None, names: NameTable::new(), open: false }
    }

    /// An extension with no backing library, for builtins registered from
    /// Rust through the same vtable.
    pub fn detached(path: &str) -> Self {
        Extension { open: true, ..Extension::new(path) }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Everything the extension published from `mangodl_init`.
    pub fn names(&self) -> &Rc<NameTable> {
        &self.names
    }

    fn close(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.library = None;
        self.names.release_all();
        true
    }
}

/// A function whose body lives in an extension.
#[derive(Clone)]
pub struct ForeignBuiltin {
    pub library: Rc<RefCell<Extension>>,
    pub func: ForeignFn,
}

fn no_file(message: impl Into<String>) -> MangoError {
    MangoError::runtime(ErrorCode::NoFile, message)
}

/// Every library ever opened, by index. Entries are retained DynLib
/// objects; failed opens keep their slot so indices never shift.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    entries: Vec<ObjRef>,
}

impl ExtensionRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn open(&mut self, heap: &Rc<Heap>, path: &str) -> MangoResult<usize> {
        std::fs::metadata(path).map_err(|e| no_file(format!("{path}: {e}")))?;

        let ext = Rc::new(RefCell::new(Extension::new(path)));
        let handle = heap.allocate(TypeTag::from_bits(TypeTag::DYNLIB), Payload::DynLib(Rc::clone(&ext)))?;
        handle.retain();
        self.entries.push(handle);
        let index = self.entries.len() - 1;

        // SAFETY: loading runs the library's constructors; extensions are
        // trusted code chosen by the program.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| no_file(e.to_string()))?;
        // SAFETY: the symbol type matches the documented init signature and
        // the pointer is only used while `library` stays loaded.
        let init = match unsafe { library.get::<InitFn>(INIT_SYMBOL) } {
            Ok(symbol) => *symbol,
            Err(_) => {
                warn!(path, "no mangodl_init export");
                return Err(no_file("Failed to find 'mangodl_init' function"));
            }
        };
        {
            let mut ext = ext.borrow_mut();
            ext.library = Some(library);
            ext.open = true;
        }

        if let Err(e) = initialise(heap, &ext, init) {
            warn!(path, error = %e.message, "extension init failed");
            ext.borrow_mut().close();
            return Err(e);
        }
        info!(path, index, names = ext.borrow().names.len(), "opened extension");
        Ok(index)
    }

    /// Resolves a handle object (an Int index) to its extension.
    pub fn get(&self, index: &ObjRef) -> MangoResult<Rc<RefCell<Extension>>> {
        let i = match (index.tag(), index.as_int()) {
            (TypeTag::INT, Some(i)) => i,
            _ => return Err(MangoError::runtime(ErrorCode::InvalidType, "Index must be integer")),
        };
        self.entry(i)
            .ok_or_else(|| MangoError::runtime(ErrorCode::InvalidValue, format!("Invalid index {i}")))
    }

    pub fn entry(&self, index: i32) -> Option<Rc<RefCell<Extension>>> {
        let obj = self.entries.get(usize::try_from(index).ok()?)?;
        match &*obj.payload() {
            Payload::DynLib(ext) => Some(Rc::clone(ext)),
            _ => None,
        }
    }

    /// 0 on the first close, -1 when already closed.
    pub fn close(&mut self, index: &ObjRef) -> MangoResult<i32> {
        let ext = self.get(index)?;
        let closed = ext.borrow_mut().close();
        if closed {
            info!(path = ext.borrow().path(), "closed extension");
        }
        Ok(if closed { 0 } else { -1 })
    }

    pub fn close_all(&mut self) {
        for obj in self.entries.drain(..) {
            if let Payload::DynLib(ext) = &*obj.payload() {
                ext.borrow_mut().close();
            }
            obj.release();
        }
    }

    /// A name the extension published into its own table.
    pub fn symbol(&self, index: &ObjRef, name: &ObjRef) -> MangoResult<ObjRef> {
        let ext = self.get(index)?;
        let name = name
            .string_bytes()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .ok_or_else(|| MangoError::runtime(ErrorCode::InvalidType, "Symbol name must be a string"))?;
        let ext = ext.borrow();
        ext.names.get_local(&name).ok_or_else(|| {
            MangoError::runtime(ErrorCode::UndefinedName, format!("Failed to locate symbol '{name}' in '{}'", ext.path))
        })
    }
}

/// Runs an init entry point against the extension's table.
pub fn initialise(heap: &Rc<Heap>, ext: &Rc<RefCell<Extension>>, init: InitFn) -> MangoResult<()> {
    let names = Rc::clone(&ext.borrow().names);
    let (status, error) = with_frame(heap, Some(Rc::clone(ext)), |frame| {
        let table = frame.push(Slot::Table(names));
        // SAFETY: `init` comes from a loaded extension (or Rust test code)
        // and receives the static vtable plus a handle valid for this frame.
        move || unsafe { init(&HOST_API, table) }
    });
    if let Some(e) = error {
        return Err(e);
    }
    if status != 0 {
        return Err(MangoError::runtime(ErrorCode::InvalidValue, format!("mangodl_init failed with status {status}")));
    }
    Ok(())
}

/// Calls a foreign builtin with already type-checked arguments.
pub fn call_foreign(rt: &mut Runtime, foreign: &ForeignBuiltin, ctx: &Rc<Context>, args: &[ObjRef]) -> MangoResult<ObjRef> {
    {
        let ext = foreign.library.borrow();
        if !ext.is_open() {
            return Err(MangoError::runtime(ErrorCode::InvalidPointer, format!("Library '{}' is closed", ext.path)));
        }
    }
    let func = foreign.func;
    let (result, error) = with_frame(&rt.heap, Some(Rc::clone(&foreign.library)), |frame| {
        let handles: Vec<Handle> = args.iter().map(|a| frame.push(Slot::Object(Rc::clone(a)))).collect();
        let table = frame.push(Slot::Table(ctx.names()));
        // SAFETY: the library is open, so `func` is still mapped; `handles`
        // outlives the call.
        move || unsafe { func(&HOST_API, handles.as_ptr(), handles.len() as u32, table) }
    });
    if let Some(e) = error {
        return Err(e);
    }
    result.ok_or_else(|| MangoError::runtime(ErrorCode::InvalidValue, "Foreign function returned no value"))
}

// ── Handle frames ───────────────────────────────────────────────────

enum Slot {
    Object(ObjRef),
    Table(Rc<NameTable>),
}

struct Frame {
    heap: Rc<Heap>,
    library: Option<Rc<RefCell<Extension>>>,
    slots: Vec<Slot>,
    error: Option<MangoError>,
}

impl Frame {
    fn push(&mut self, slot: Slot) -> Handle {
        self.slots.push(slot);
        self.slots.len() as Handle
    }

    fn object(&self, handle: Handle) -> Option<ObjRef> {
        match self.slots.get((handle as usize).checked_sub(1)?)? {
            Slot::Object(obj) => Some(Rc::clone(obj)),
            Slot::Table(_) => None,
        }
    }

    fn table(&self, handle: Handle) -> Option<Rc<NameTable>> {
        match self.slots.get((handle as usize).checked_sub(1)?)? {
            Slot::Table(t) => Some(Rc::clone(t)),
            Slot::Object(_) => None,
        }
    }

    fn alloc(&mut self, made: MangoResult<ObjRef>) -> Handle {
        match made {
            Ok(obj) => self.push(Slot::Object(obj)),
            Err(e) => {
                self.fail(e);
                0
            }
        }
    }

    fn fail(&mut self, e: MangoError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }
}

thread_local! {
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// Pushes a frame, lets `prepare` register handles, runs the returned
/// foreign call with no frame borrow held, then pops. Yields the result
/// handle resolved to an object (for calls) or the raw status, plus any
/// error the extension raised.
fn with_frame<R, F, C>(heap: &Rc<Heap>, library: Option<Rc<RefCell<Extension>>>, prepare: F) -> (R::Output, Option<MangoError>)
where
    R: FrameResult,
    F: FnOnce(&mut Frame) -> C,
    C: FnOnce() -> R,
{
    let frame = Frame { heap: Rc::clone(heap), library, slots: Vec::new(), error: None };
    FRAMES.with(|frames| frames.borrow_mut().push(frame));
    let call = FRAMES.with(|frames| frames.borrow_mut().last_mut().map(prepare));
    let raw = call.map(|c| c());
    let frame = FRAMES.with(|frames| frames.borrow_mut().pop());
    match (raw, frame) {
        (Some(raw), Some(frame)) => {
            let out = raw.resolve(&frame);
            (out, frame.error)
        }
        _ => (R::missing(), Some(MangoError::internal("Foreign call frame lost"))),
    }
}

trait FrameResult {
    type Output;
    fn resolve(self, frame: &Frame) -> Self::Output;
    fn missing() -> Self::Output;
}

impl FrameResult for c_int {
    type Output = c_int;
    fn resolve(self, _frame: &Frame) -> c_int {
        self
    }
    fn missing() -> c_int {
        -1
    }
}

impl FrameResult for Handle {
    type Output = Option<ObjRef>;
    fn resolve(self, frame: &Frame) -> Option<ObjRef> {
        frame.object(self)
    }
    fn missing() -> Option<ObjRef> {
        None
    }
}

fn with_current<T>(default: T, f: impl FnOnce(&mut Frame) -> T) -> T {
    FRAMES.with(|frames| match frames.try_borrow_mut() {
        Ok(mut frames) => match frames.last_mut() {
            Some(frame) => f(frame),
            None => default,
        },
        Err(_) => default,
    })
}

/// # Safety
/// `ptr` must be null or point at a NUL-terminated string.
unsafe fn c_text(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: guaranteed by the caller.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn tag_from_abi(bits: u8) -> TypeTag {
    TypeTag::from_bits(bits)
}

// ── Vtable entries ──────────────────────────────────────────────────

unsafe extern "C" fn host_error_set(kind: u32, code: u32, message: *const c_char) {
    // SAFETY: the ABI requires a C string or null.
    let message = unsafe { c_text(message) }.unwrap_or_default();
    let kind = ErrorKind::from_code(kind).unwrap_or(ErrorKind::Runtime);
    let code = ErrorCode::from_number(code).unwrap_or(ErrorCode::InvalidValue);
    with_current((), |frame| frame.fail(MangoError::new(kind, code, message)));
}

unsafe extern "C" fn host_error_set_pos(line: u32, column: u32, file: *const c_char) {
    // SAFETY: the ABI requires a C string or null.
    let file = unsafe { c_text(file) }.map(|f| Rc::from(f.as_str()));
    with_current((), |frame| {
        if let Some(e) = frame.error.as_mut() {
            e.pos = Some(SourcePos::new(line, column, file));
        }
    });
}

extern "C" fn host_error_is_set() -> c_int {
    with_current(0, |frame| frame.error.is_some() as c_int)
}

extern "C" fn host_int_new(value: i32) -> Handle {
    with_current(0, |frame| {
        let made = frame.heap.int(value);
        frame.alloc(made)
    })
}

extern "C" fn host_char_new(value: c_char) -> Handle {
    with_current(0, |frame| {
        let made = frame.heap.chr(value as u8);
        frame.alloc(made)
    })
}

extern "C" fn host_array_new(elem_type: u8, len: u32) -> Handle {
    with_current(0, |frame| {
        let made = frame.heap.array(tag_from_abi(elem_type), len as usize);
        frame.alloc(made)
    })
}

extern "C" fn host_pointer_new(elem_type: u8, target: Handle) -> Handle {
    with_current(0, |frame| {
        let target = frame.object(target);
        let made = frame.heap.pointer(tag_from_abi(elem_type), target);
        frame.alloc(made)
    })
}

unsafe extern "C" fn host_names_set(table: Handle, name: *const c_char, value: Handle) -> c_int {
    // SAFETY: the ABI requires a C string or null.
    let Some(name) = (unsafe { c_text(name) }) else { return -1 };
    with_current(-1, |frame| match (frame.table(table), frame.object(value)) {
        (Some(table), Some(value)) => {
            table.set(&name, value);
            0
        }
        _ => -1,
    })
}

unsafe extern "C" fn host_names_get(table: Handle, name: *const c_char) -> Handle {
    // SAFETY: the ABI requires a C string or null.
    let Some(name) = (unsafe { c_text(name) }) else { return 0 };
    with_current(0, |frame| match frame.table(table).and_then(|t| t.get(&name)) {
        Some(obj) => frame.push(Slot::Object(obj)),
        None => 0,
    })
}

unsafe extern "C" fn host_builtin_new(
    name: *const c_char,
    ret_type: u8,
    argc: u32,
    arg_types: *const u8,
    func: Option<ForeignFn>,
) -> Handle {
    // SAFETY: the ABI requires a C string or null.
    let Some(name) = (unsafe { c_text(name) }) else { return 0 };
    let Some(func) = func else { return 0 };
    let types: &[u8] = if argc == 0 || arg_types.is_null() {
        &[]
    } else {
        // SAFETY: the caller passes `argc` type bytes.
        unsafe { std::slice::from_raw_parts(arg_types, argc as usize) }
    };
    with_current(0, |frame| {
        let Some(library) = frame.library.clone() else {
            frame.fail(MangoError::illegal("builtin_new called outside an extension"));
            return 0;
        };
        let params = types
            .iter()
            .enumerate()
            .map(|(i, &t)| Param { name: format!("arg{i}"), tag: tag_from_abi(t) })
            .collect();
        let function = Function::new(name, params, tag_from_abi(ret_type), None);
        function.define(FuncBody::Foreign(ForeignBuiltin { library, func }));
        let made = frame.heap.function(function);
        frame.alloc(made)
    })
}

extern "C" fn host_int_value(value: Handle) -> i32 {
    with_current(0, |frame| frame.object(value).and_then(|o| o.scalar()).unwrap_or_default())
}

extern "C" fn host_char_value(value: Handle) -> c_char {
    with_current(0, |frame| frame.object(value).and_then(|o| o.as_char()).unwrap_or_default() as c_char)
}

extern "C" fn host_type_of(value: Handle) -> u8 {
    with_current(0xFF, |frame| frame.object(value).map(|o| o.tag().bits()).unwrap_or(0xFF))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;

    unsafe extern "C" fn add(api: *const HostApi, args: *const Handle, argc: u32, _table: Handle) -> Handle {
        let api = unsafe { &*api };
        let args = unsafe { std::slice::from_raw_parts(args, argc as usize) };
        let sum = (api.int_value)(args[0]) + (api.int_value)(args[1]);
        (api.int_new)(sum)
    }

    unsafe extern "C" fn refuse(api: *const HostApi, _args: *const Handle, _argc: u32, _table: Handle) -> Handle {
        let api = unsafe { &*api };
        unsafe { (api.error_set)(1, 407, c"refused".as_ptr()) };
        0
    }

    unsafe extern "C" fn init_ok(api: *const HostApi, table: Handle) -> c_int {
        let api = unsafe { &*api };
        assert_eq!(api.version, HOST_API_VERSION);
        let answer = (api.int_new)(42);
        let types = [TypeTag::INT.bits(), TypeTag::INT.bits()];
        let add = unsafe { (api.builtin_new)(c"add".as_ptr(), TypeTag::INT.bits(), 2, types.as_ptr(), Some(add)) };
        let refuse = unsafe { (api.builtin_new)(c"refuse".as_ptr(), TypeTag::INT.bits(), 0, std::ptr::null(), Some(refuse)) };
        unsafe {
            (api.names_set)(table, c"answer".as_ptr(), answer);
            (api.names_set)(table, c"add".as_ptr(), add);
            (api.names_set)(table, c"refuse".as_ptr(), refuse);
        }
        0
    }

    unsafe extern "C" fn init_fails(_api: *const HostApi, _table: Handle) -> c_int {
        3
    }

    fn loaded(rt: &Runtime) -> Rc<RefCell<Extension>> {
        let ext = Rc::new(RefCell::new(Extension::detached("test-ext")));
        initialise(&rt.heap, &ext, init_ok).unwrap();
        ext
    }

    #[test]
    fn init_publishes_names() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let ext = loaded(&rt);
        let names = Rc::clone(ext.borrow().names());
        assert_eq!(names.get_local("answer").unwrap().as_int(), Some(42));
        assert_eq!(names.get_local("answer").unwrap().refcount(), 1);
        assert!(names.get_local("add").unwrap().function().unwrap().is_native());
    }

    #[test]
    fn foreign_builtins_are_callable() {
        let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let ext = loaded(&rt);
        let g = Rc::clone(rt.globals());
        let add = ext.borrow().names().get_local("add").unwrap();
        let args = [rt.heap.int(40).unwrap(), rt.heap.int(2).unwrap()];
        assert_eq!(rt.call(&g, &add, &args).unwrap().as_int(), Some(42));

        let refuse = ext.borrow().names().get_local("refuse").unwrap();
        let err = rt.call(&g, &refuse, &[]).unwrap_err();
        assert_eq!((err.code, err.message.as_str()), (ErrorCode::InvalidValue, "refused"));
    }

    #[test]
    fn calling_after_close_is_invalid_pointer() {
        let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let ext = loaded(&rt);
        let g = Rc::clone(rt.globals());
        let add = ext.borrow().names().get_local("add").unwrap();
        ext.borrow_mut().close();
        let args = [rt.heap.int(1).unwrap(), rt.heap.int(2).unwrap()];
        assert_eq!(rt.call(&g, &add, &args).unwrap_err().code, ErrorCode::InvalidPointer);
    }

    #[test]
    fn nonzero_init_status_is_invalid_value() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let ext = Rc::new(RefCell::new(Extension::detached("bad")));
        let err = initialise(&rt.heap, &ext, init_fails).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidValue);
    }

    #[test]
    fn registry_rejects_bad_handles() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let reg = ExtensionRegistry::default();
        let s = rt.heap.string(b"x").unwrap();
        assert_eq!(reg.get(&s).unwrap_err().message, "Index must be integer");
        let i = rt.heap.int(0).unwrap();
        assert_eq!(reg.get(&i).unwrap_err().code, ErrorCode::InvalidValue);
    }

    #[test]
    fn missing_file_keeps_no_entry() {
        let rt = Runtime::new(RuntimeConfig::default()).unwrap();
        let mut reg = ExtensionRegistry::default();
        let err = reg.open(&rt.heap, "/no/such/lib.so").unwrap_err();
        assert_eq!(err.code, ErrorCode::NoFile);
        assert!(reg.is_empty());
    }

    #[test]
    fn handles_outside_a_frame_are_null() {
        assert_eq!(host_int_new(3), 0);
        assert_eq!(host_error_is_set(), 0);
        assert_eq!(host_type_of(1), 0xFF);
    }
}
