//! File-level driver: decides from the extension whether a file is a
//! bytecode image or source, then compiles, writes or executes it.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::bytecode::{BytecodeMode, Compiler, FsLoader, Program, hexdump};
use crate::error::{ErrorCode, MangoError, MangoResult};
use crate::object::ObjRef;
use crate::runtime::Runtime;
use crate::{interpreter, parser, vm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Compile in memory and run.
    #[default]
    Execute,
    /// Write `<name>.mc` next to the source.
    CompileExecutable,
    /// Write `<name>.ml` next to the source.
    CompileLibrary,
    /// Evaluate the AST directly, skipping bytecode.
    Interpret,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    pub idata: bool,
    /// `.ml` images referenced at the start of every compiled program.
    pub libraries: Vec<String>,
    pub dump: bool,
    pub ast: bool,
    pub json: bool,
    pub color: bool,
    pub heap_limit: Option<usize>,
}

/// What a run produced.
#[derive(Debug)]
pub enum Outcome {
    /// Value of the last top-level instruction, if there was one.
    Ran(Option<ObjRef>),
    Wrote(PathBuf),
    /// Only printed something (`--ast`).
    Printed,
}

/// Whole-file read. Every failure surfaces as `NoFile`.
pub fn read_all(path: impl AsRef<Path>) -> MangoResult<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path)
        .map_err(|e| MangoError::runtime(ErrorCode::NoFile, format!("Could not open file '{}': {e}", path.display())))
}

/// `prog.mg` becomes `prog.mc` or `prog.ml`.
pub fn output_path(source: &Path, mode: RunMode) -> Option<PathBuf> {
    match mode {
        RunMode::CompileExecutable => Some(source.with_extension("mc")),
        RunMode::CompileLibrary => Some(source.with_extension("ml")),
        RunMode::Execute | RunMode::Interpret => None,
    }
}

pub fn run(rt: &mut Runtime, filename: &Path, options: &RunOptions, out: &mut dyn Write) -> MangoResult<Outcome> {
    let name = filename.display().to_string();
    match filename.extension().and_then(|e| e.to_str()) {
        Some("ml") => Err(MangoError::bytecode(
            ErrorCode::InvalidValue,
            format!("'{name}' is a library; reference it with -l instead of running it"),
        )),
        Some("mc") => {
            let bytes = read_all(filename)?;
            if options.dump {
                emit(out, &hexdump(&bytes))?;
            }
            let program = Program::load(bytes, &name)?;
            info!(file = %name, "executing bytecode");
            Ok(Outcome::Ran(vm::run_program(rt, program)?))
        }
        _ => {
            let bytes = read_all(filename)?;
            let source = String::from_utf8_lossy(&bytes);
            debug!(file = %name, bytes = bytes.len(), "read source");
            run_source(rt, &source, &name, options, out)
        }
    }
}

/// Runs (or compiles) source text that claims to come from `name`.
pub fn run_source(rt: &mut Runtime, source: &str, name: &str, options: &RunOptions, out: &mut dyn Write) -> MangoResult<Outcome> {
    let root = parser::parse_source(source, Some(name))?;
    if options.ast {
        let json = serde_json::to_string_pretty(&root)
            .map_err(|e| MangoError::internal(format!("Could not serialise the AST: {e}")))?;
        emit(out, &json)?;
        emit(out, "\n")?;
        return Ok(Outcome::Printed);
    }
    if options.mode == RunMode::Interpret {
        return Ok(Outcome::Ran(interpreter::run(rt, &root)?));
    }

    let bytecode_mode = match options.mode {
        RunMode::CompileLibrary => BytecodeMode::Library,
        RunMode::CompileExecutable => BytecodeMode::Executable,
        RunMode::Execute | RunMode::Interpret => BytecodeMode::Execute,
    };
    let bytes = Compiler::new(bytecode_mode, &FsLoader)
        .with_idata(options.idata)
        .with_libraries(options.libraries.clone())
        .compile(&root)?;
    if options.dump {
        emit(out, &hexdump(&bytes))?;
    }

    match output_path(Path::new(name), options.mode) {
        Some(target) => {
            std::fs::write(&target, &bytes).map_err(|e| {
                MangoError::runtime(ErrorCode::NoFile, format!("Could not write '{}': {e}", target.display()))
            })?;
            info!(file = %target.display(), bytes = bytes.len(), "wrote bytecode");
            Ok(Outcome::Wrote(target))
        }
        None => {
            let program = Program::load(bytes, name)?;
            Ok(Outcome::Ran(vm::run_program(rt, program)?))
        }
    }
}

fn emit(out: &mut dyn Write, text: &str) -> MangoResult<()> {
    out.write_all(text.as_bytes())
        .map_err(|e| MangoError::runtime(ErrorCode::UnknownFd, format!("Could not write output: {e}")))
}
