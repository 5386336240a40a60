use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn mango() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mango"))
}

fn write_source(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, text).expect("write source");
    path
}

fn run(args: &[&str]) -> Output {
    mango().args(args).output().expect("failed to run mango")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

// --- Running source ---

#[test]
fn runs_source_and_writes_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "hello.mg", "write(1, \"hello\\n\", 6);");
    let out = run(&[src.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hello\n");
}

#[test]
fn interpret_flag_gives_same_output() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(
        dir.path(),
        "loop.mg",
        "int i; for (i = 0; i < 3; i++) -> [ if (i == 1) -> [ write(1, \"b\", 1); ] else -> [ write(1, \"a\", 1); ]; ];",
    );
    let compiled = run(&[src.to_str().unwrap()]);
    let interpreted = run(&["--interpret", src.to_str().unwrap()]);
    assert!(compiled.status.success(), "stderr: {}", stderr(&compiled));
    assert_eq!(stdout(&compiled), "aba");
    assert_eq!(stdout(&interpreted), "aba");
}

#[test]
fn runtime_error_reports_position_and_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "bad.mg", "int a = 1;\nb = 2;");
    let out = run(&["--no-color", src.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("Runtime Error (File '"), "stderr: {err}");
    assert!(err.contains("bad.mg', Line 2, Column 1):"), "stderr: {err}");
    assert!(err.contains("Undefined name 'b'"), "stderr: {err}");
    assert!(err.contains("2 | b = 2;"), "missing snippet: {err}");
}

#[test]
fn syntax_error_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "syn.mg", "int x = 1 int y;");
    let out = run(&["--no-color", src.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Syntax Error (File '"), "stderr: {}", stderr(&out));
}

#[test]
fn json_errors_are_machine_readable() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "bad.mg", "1 / 0;");
    let out = run(&["--json", src.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let line = stderr(&out);
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("JSON on stderr");
    assert_eq!(v["code"], "E400");
    assert_eq!(v["kind"], "Runtime Error");
    assert_eq!(v["labels"][0]["line"], 1);
}

#[test]
fn missing_file_fails() {
    let out = run(&["--no-color", "/definitely/not/here.mg"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Could not open file"), "stderr: {}", stderr(&out));
}

#[test]
fn stops_at_first_failing_file() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_source(dir.path(), "a.mg", "nope;");
    let good = write_source(dir.path(), "b.mg", "write(1, \"x\", 1);");
    let out = run(&[bad.to_str().unwrap(), good.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(stdout(&out), "");
}

// --- Compiling ---

#[test]
fn compile_writes_executable_image() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "prog.mg", "write(1, \"img\\n\", 4);");
    let out = run(&["--cm", src.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "", "compiling must not run the program");

    let image = dir.path().join("prog.mc");
    let bytes = fs::read(&image).expect("image written");
    assert_eq!(&bytes[..4], &[0x0B, b'm', b'c', 0x0E]);

    let out = run(&[image.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "img\n");
}

#[test]
fn compile_flags_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "prog.mg", "1;");
    let out = run(&["--cm", "--cl", src.to_str().unwrap()]);
    assert!(!out.status.success());
}

#[test]
fn library_images_load_through_references() {
    let dir = tempfile::tempdir().unwrap();
    let lib = write_source(dir.path(), "greet.mg", "fun int greet() -> [ write(1, \"hi\", 2); return 0; ];");
    let out = run(&["--cl", lib.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let image = dir.path().join("greet.ml");
    assert_eq!(&fs::read(&image).unwrap()[..4], &[0x0B, b'm', b'l', 0x0F]);

    let run_lib = run(&["--no-color", image.to_str().unwrap()]);
    assert_eq!(run_lib.status.code(), Some(1));

    let main = write_source(dir.path(), "main.mg", "greet();");
    let lib_ref = dir.path().join("greet").display().to_string();
    let out = run(&["-l", &lib_ref, main.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hi");
}

#[test]
fn idata_images_run() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "s.mg", "write(1, \"ab\", 2); write(1, \"ab\", 2);");
    let out = run(&["-i", "--cm", src.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let out = run(&[dir.path().join("s.mc").to_str().unwrap()]);
    assert_eq!(stdout(&out), "abab");
}

// --- Inspection ---

#[test]
fn dump_prints_hexdump() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "d.mg", "1 + 2;");
    let out = run(&["--dump", src.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).starts_with("00000000  0b 6d 63 0e"), "stdout: {}", stdout(&out));
}

#[test]
fn ast_prints_json() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), "t.mg", "int x = 1;");
    let out = run(&["--ast", src.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("AST JSON");
    assert!(v.to_string().contains("\"x\""));
}

#[test]
fn explain_known_and_unknown_codes() {
    let out = run(&["--explain", "E404"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("E404: undefined name"));

    let out = run(&["--explain", "E999"]);
    assert!(!out.status.success());
}
