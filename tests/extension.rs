use std::path::{Path, PathBuf};
use std::process::Command;

use mango::bytecode::{BytecodeMode, Program, compile};
use mango::object::ObjRef;
use mango::parser::parse_source;
use mango::{Runtime, RuntimeConfig, interpreter, vm};

/// A native extension exporting `add(int, int)` through the host vtable.
const ADD_EXTENSION: &str = r#"
#![allow(dead_code)]
use std::ffi::{c_char, c_int};

type Handle = u32;
type ForeignFn = unsafe extern "C" fn(*const HostApi, *const Handle, u32, Handle) -> Handle;

#[repr(C)]
pub struct HostApi {
    version: u32,
    error_set: unsafe extern "C" fn(u32, u32, *const c_char),
    error_set_pos: unsafe extern "C" fn(u32, u32, *const c_char),
    error_is_set: extern "C" fn() -> c_int,
    int_new: extern "C" fn(i32) -> Handle,
    char_new: extern "C" fn(c_char) -> Handle,
    array_new: extern "C" fn(u8, u32) -> Handle,
    pointer_new: extern "C" fn(u8, Handle) -> Handle,
    names_set: unsafe extern "C" fn(Handle, *const c_char, Handle) -> c_int,
    names_get: unsafe extern "C" fn(Handle, *const c_char) -> Handle,
    builtin_new: unsafe extern "C" fn(*const c_char, u8, u32, *const u8, Option<ForeignFn>) -> Handle,
    int_value: extern "C" fn(Handle) -> i32,
    char_value: extern "C" fn(Handle) -> c_char,
    type_of: extern "C" fn(Handle) -> u8,
}

unsafe extern "C" fn add(api: *const HostApi, args: *const Handle, argc: u32, _table: Handle) -> Handle {
    let api = &*api;
    let args = std::slice::from_raw_parts(args, argc as usize);
    (api.int_new)((api.int_value)(args[0]) + (api.int_value)(args[1]))
}

#[no_mangle]
pub unsafe extern "C" fn mangodl_init(api: *const HostApi, table: Handle) -> c_int {
    let api = &*api;
    let types = [0u8, 0u8];
    let name = b"add\0".as_ptr() as *const c_char;
    let func = (api.builtin_new)(name, 0, 2, types.as_ptr(), Some(add));
    (api.names_set)(table, name, func)
}
"#;

/// Builds the extension into `dir`, or `None` when no rustc is on hand.
fn build_extension(dir: &Path) -> Option<PathBuf> {
    let src = dir.join("add_ext.rs");
    std::fs::write(&src, ADD_EXTENSION).unwrap();
    let out = dir.join(format!("{}add_ext{}", std::env::consts::DLL_PREFIX, std::env::consts::DLL_SUFFIX));
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let status = Command::new(rustc)
        .args(["--crate-type", "cdylib", "--edition", "2021", "-o"])
        .arg(&out)
        .arg(&src)
        .output();
    match status {
        Ok(o) if o.status.success() => Some(out),
        Ok(o) => panic!("extension build failed: {}", String::from_utf8_lossy(&o.stderr)),
        Err(e) => {
            eprintln!("rustc unavailable ({e}); skipping");
            None
        }
    }
}

fn program_for(lib: &Path) -> String {
    format!(
        "int h = dlopen(\"{}\");\nint r = dlsym(h, \"add\")(2, 3);\nint first = dlclose(h);\nint second = dlclose(h);",
        lib.display()
    )
}

fn global(rt: &Runtime, name: &str) -> i32 {
    let obj: ObjRef = rt.globals().names().get(name).unwrap_or_else(|| panic!("'{name}' is not bound"));
    obj.as_int().unwrap()
}

#[test]
fn extension_builtins_run_from_compiled_code() {
    let dir = tempfile::tempdir().unwrap();
    let Some(lib) = build_extension(dir.path()) else { return };
    let root = parse_source(&program_for(&lib), Some("ext.mg")).unwrap();
    let bytes = compile(&root, BytecodeMode::Execute, false).unwrap();
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    vm::run_program(&mut rt, Program::load(bytes, "ext.mc").unwrap()).unwrap();

    assert_eq!(global(&rt, "h"), 0);
    assert_eq!(global(&rt, "r"), 5);
    assert_eq!(global(&rt, "first"), 0);
    assert_eq!(global(&rt, "second"), -1);
    assert!(!rt.extensions.entry(0).unwrap().borrow().is_open());
    rt.teardown();
}

#[test]
fn extension_builtins_run_from_the_tree_evaluator() {
    let dir = tempfile::tempdir().unwrap();
    let Some(lib) = build_extension(dir.path()) else { return };
    let root = parse_source(&program_for(&lib), Some("ext.mg")).unwrap();
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    interpreter::run(&mut rt, &root).unwrap();

    assert_eq!(global(&rt, "r"), 5);
    assert_eq!((global(&rt, "first"), global(&rt, "second")), (0, -1));
    rt.teardown();
}

