use std::path::Path;
use std::rc::Rc;

use mango::bytecode::format::HEADER_LEN;
use mango::bytecode::{BytecodeMode, Program, compile};
use mango::names::NameTable;
use mango::object::{self, ObjRef, TypeTag, same_value};
use mango::parser::parse_source;
use mango::{ErrorCode, Runtime, RuntimeConfig, interpreter, vm};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("runtime")
}

fn via_vm(src: &str, idata: bool) -> (Runtime, Option<ObjRef>) {
    let root = parse_source(src, Some("prog.mg")).expect("parse");
    let bytes = compile(&root, BytecodeMode::Execute, idata).expect("compile");
    let mut rt = runtime();
    let last = vm::run_program(&mut rt, Program::load(bytes, "prog.mc").expect("load")).expect("vm run");
    (rt, last)
}

fn via_ast(src: &str) -> (Runtime, Option<ObjRef>) {
    let root = parse_source(src, Some("prog.mg")).expect("parse");
    let mut rt = runtime();
    let last = interpreter::run(&mut rt, &root).expect("ast run");
    (rt, last)
}

fn global(rt: &Runtime, name: &str) -> ObjRef {
    rt.globals().names().get(name).unwrap_or_else(|| panic!("'{name}' is not bound"))
}

const ROUND_TRIP_PROGRAMS: &[(&str, &[&str])] = &[
    ("1 + 2 * 3 - -4;", &[]),
    ("int x = 7 % 3; chr c = nullchar; int eq = x == 1;", &["x", "c", "eq"]),
    ("*chr s = \"mango\"; chr m = s[0]; s[1] = m;", &["s", "m"]),
    ("int a[4]; int i; for (i = 0; i < 4; i++) -> [ a[i] = i * i; ];", &["a", "i"]),
    ("int n = 10; int steps = 0; while (n > 1) -> [ if (n % 2 == 0) -> [ n = n / 2; ] else -> [ n = 3 * n + 1; ]; steps++; ];", &["n", "steps"]),
    ("fun int fact(int k) -> [ if (k < 2) -> [ return 1; ]; return k * fact(k - 1); ]; int f = fact(6);", &["f"]),
    ("struct pair -> [ int a = 3; int b; ]; pair p; p.b = p.a + 4; int sum = p.a + p.b;", &["p", "sum"]),
    ("int v = 5; *int p = &v; int w = *p + 1;", &["v", "w"]),
    ("typedef int as number; number z = 12; const int k = 2; unsigned int u = 9; int q = u / k;", &["z", "q"]),
    ("int g = 1; fun int bump() -> [ extern g = g + 10; return g; ]; int r = bump();", &["g", "r"]),
];

#[test]
fn compiled_programs_match_direct_evaluation() {
    for (src, names) in ROUND_TRIP_PROGRAMS {
        for idata in [false, true] {
            let (vm_rt, vm_last) = via_vm(src, idata);
            let (ast_rt, ast_last) = via_ast(src);
            let (Some(a), Some(b)) = (&vm_last, &ast_last) else {
                panic!("no result for {src}");
            };
            assert!(same_value(a, b), "last values differ for {src} (idata {idata})");
            for name in *names {
                assert!(
                    same_value(&global(&vm_rt, name), &global(&ast_rt, name)),
                    "'{name}' differs for {src} (idata {idata})"
                );
            }
        }
    }
}

#[test]
fn errors_match_between_paths() {
    for src in ["int x = y;", "1 / 0;", "int a[2]; a[5];", "fun int f(); f();", "*chr s = \"x\"; s = 1;"] {
        let root = parse_source(src, Some("prog.mg")).unwrap();
        let bytes = compile(&root, BytecodeMode::Execute, false).unwrap();
        let vm_err = vm::run_program(&mut runtime(), Program::load(bytes, "prog.mc").unwrap()).unwrap_err();
        let ast_err = interpreter::run(&mut runtime(), &root).unwrap_err();
        assert_eq!((vm_err.code, &vm_err.message), (ast_err.code, &ast_err.message), "{src}");
        assert_eq!(vm_err.pos, ast_err.pos, "{src}");
    }
}

#[test]
fn retain_release_pairs_are_idempotent() {
    let rt = runtime();
    let obj = rt.heap.int(4).unwrap();
    obj.retain();
    let before = obj.refcount();
    for _ in 0..5 {
        object::retain(Some(&obj));
        object::release(Some(&obj));
    }
    assert_eq!(obj.refcount(), before);

    let loose = rt.heap.int(1).unwrap();
    assert_eq!(loose.refcount(), 0);
    loose.release();
    object::release(Some(&loose));
    assert_eq!(loose.refcount(), 0);
}

#[test]
fn child_scope_shadows_parent() {
    let rt = runtime();
    let parent = NameTable::new();
    parent.set("x", rt.heap.int(1).unwrap());
    parent.set("only_parent", rt.heap.int(2).unwrap());
    let child = NameTable::with_parent(Rc::clone(&parent));
    child.set("x", rt.heap.int(9).unwrap());

    assert_eq!(child.get("x").and_then(|o| o.as_int()), Some(9));
    assert_eq!(child.get("only_parent").and_then(|o| o.as_int()), Some(2));
    assert!(child.get_local("only_parent").is_none());

    child.remove("x");
    assert!(child.get_local("x").is_none());
    assert_eq!(parent.get("x").and_then(|o| o.as_int()), Some(1));
}

#[test]
fn idata_stores_each_literal_once() {
    let root = parse_source("*chr a = \"dup\"; *chr b = \"dup\"; *chr c = \"other\";", None).unwrap();
    let bytes = compile(&root, BytecodeMode::Execute, true).unwrap();
    let program = Program::load(bytes, "t.mc").unwrap();
    assert!(program.uses_idata());
    assert_eq!(program.idata_len(), 2);
    assert_eq!(&*program.idata(0).unwrap(), b"dup");
    assert_eq!(&*program.idata(1).unwrap(), b"other");
}

#[test]
fn scenario_a_one_plus_two() {
    let root = parse_source("1 + 2;", None).unwrap();
    let bytes = compile(&root, BytecodeMode::Execute, false).unwrap();
    assert_eq!(&bytes[..4], &[0x0B, b'm', b'c', 0x0E]);
    assert_eq!(
        &bytes[HEADER_LEN..HEADER_LEN + 12],
        &[0x9D, 0x00, 0x9B, 0, 0, 0, 1, 0x9B, 0, 0, 0, 2]
    );
    let mut rt = runtime();
    let last = vm::run_program(&mut rt, Program::load(bytes, "a.mc").unwrap()).unwrap().unwrap();
    assert_eq!(last.tag(), TypeTag::INT);
    assert_eq!(last.as_int(), Some(3));
}

#[test]
fn scenario_b_string_addition_is_illegal() {
    let root = parse_source("\"ab\" + \"cd\";", Some("b.mg")).unwrap();
    let bytes = compile(&root, BytecodeMode::Execute, false).unwrap();
    let err = vm::run_program(&mut runtime(), Program::load(bytes, "b.mc").unwrap()).unwrap_err();
    assert_eq!(err.code, ErrorCode::IllegalOperation);
}

#[test]
fn scenario_c_argument_type_checked_before_body() {
    let src = "int entered = 0; fun int f(int a) -> [ entered = 1; return a; ]; chr c = nullchar; f(c);";
    let root = parse_source(src, Some("c.mg")).unwrap();
    let bytes = compile(&root, BytecodeMode::Execute, false).unwrap();
    let mut rt = runtime();
    let err = vm::run_program(&mut rt, Program::load(bytes, "c.mc").unwrap()).unwrap_err();
    assert_eq!(err.message, "Mismatched types");
    assert_eq!(global(&rt, "entered").as_int(), Some(0));
}

#[test]
fn scenario_d_for_loop_runs_three_times() {
    let (rt, _) = via_vm("int x = 40; int i; for (i = 0; i < 3; i = i + 1) -> [ x = x + 1; ];", false);
    assert_eq!(global(&rt, "x").as_int(), Some(43));
}

#[test]
fn scenario_e_libraries_without_init_stay_closed() {
    let candidates = [
        "/lib/x86_64-linux-gnu/libm.so.6",
        "/usr/lib/x86_64-linux-gnu/libm.so.6",
        "/lib64/libm.so.6",
        "/usr/lib/libm.so.6",
        "/lib/aarch64-linux-gnu/libm.so.6",
        "/lib/x86_64-linux-gnu/libdl.so.2",
        "/usr/lib/x86_64-linux-gnu/libdl.so.2",
        "/lib64/libdl.so.2",
    ];
    let found: Vec<&str> = candidates.iter().copied().filter(|p| Path::new(p).exists()).collect();
    if found.is_empty() {
        eprintln!("no system shared library found; skipping");
        return;
    }
    let mut rt = runtime();
    for (i, path) in found.iter().take(2).enumerate() {
        let err = rt.extensions.open(&rt.heap, path).unwrap_err();
        assert!(err.message.contains("mangodl_init"), "unexpected message: {}", err.message);
        let entry = rt.extensions.entry(i as i32).expect("failed libraries keep their slot");
        assert!(!entry.borrow().is_open());
    }
}

const COUNTDOWN: &str = "fun int down(int n) -> [ if (n < 1) -> [ return 0; ]; return down(n - 1) + 1; ]; int r = down(DEPTH);";

fn countdown(depth: usize) -> String {
    COUNTDOWN.replace("DEPTH", &depth.to_string())
}

#[test]
fn deep_recursion_runs_on_an_ordinary_thread() {
    let src = countdown(999);
    let (vm_rt, _) = via_vm(&src, false);
    assert_eq!(global(&vm_rt, "r").as_int(), Some(999));
    let (ast_rt, _) = via_ast(&src);
    assert_eq!(global(&ast_rt, "r").as_int(), Some(999));
}

#[test]
fn recursion_past_the_cap_is_an_error_not_a_crash() {
    let root = parse_source(&countdown(5000), Some("deep.mg")).unwrap();
    let bytes = compile(&root, BytecodeMode::Execute, false).unwrap();
    let vm_err = vm::run_program(&mut runtime(), Program::load(bytes, "deep.mc").unwrap()).unwrap_err();
    assert_eq!((vm_err.code, vm_err.message.as_str()), (ErrorCode::Memory, "Maximum call depth exceeded"));
    let ast_err = interpreter::run(&mut runtime(), &root).unwrap_err();
    assert_eq!(ast_err.code, ErrorCode::Memory);
}
