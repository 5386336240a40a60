use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use mango::diagnostic::ansi::AnsiRenderer;
use mango::diagnostic::{Diagnostic, json, registry};
use mango::runtime::{Io, Runtime, RuntimeConfig};
use mango::{MangoError, RunMode, RunOptions, run, signal};

#[derive(Parser, Debug)]
#[command(name = "mango", version, about = "Compile and run mango programs")]
struct Cli {
    /// Source (.mg) or bytecode (.mc) files, run in order
    #[arg(required_unless_present = "explain")]
    files: Vec<PathBuf>,

    /// Write an executable image (<name>.mc) instead of running
    #[arg(long, visible_alias = "cm", conflicts_with = "compile_lib")]
    compile: bool,

    /// Write a library image (<name>.ml) instead of running
    #[arg(long, visible_alias = "cl")]
    compile_lib: bool,

    /// Evaluate the syntax tree directly instead of compiling
    #[arg(long, conflicts_with_all = ["compile", "compile_lib"])]
    interpret: bool,

    /// Pool string literals into an idata table
    #[arg(short, long)]
    idata: bool,

    /// Library image to load before the program (repeatable)
    #[arg(short = 'l', long = "library", value_name = "LIB")]
    libraries: Vec<String>,

    /// Trace every executed instruction
    #[arg(short, long)]
    debug: bool,

    /// Print a hexdump of the bytecode
    #[arg(long)]
    dump: bool,

    /// Print the syntax tree as JSON instead of running
    #[arg(long)]
    ast: bool,

    /// Report errors as JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    no_color: bool,

    /// Maximum number of live objects
    #[arg(long, value_name = "N")]
    heap_limit: Option<usize>,

    /// Explain an error code, e.g. E404
    #[arg(long, value_name = "CODE")]
    explain: Option<String>,
}

impl Cli {
    fn options(&self) -> RunOptions {
        let mode = if self.compile {
            RunMode::CompileExecutable
        } else if self.compile_lib {
            RunMode::CompileLibrary
        } else if self.interpret {
            RunMode::Interpret
        } else {
            RunMode::Execute
        };
        RunOptions {
            mode,
            idata: self.idata,
            libraries: self.libraries.clone(),
            dump: self.dump,
            ast: self.ast,
            json: self.json,
            color: !self.no_color && std::io::stderr().is_terminal(),
            heap_limit: self.heap_limit,
        }
    }
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "mango=trace" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn report(err: &MangoError, options: &RunOptions) {
    let mut d = Diagnostic::from(err);
    let source = err
        .pos
        .as_ref()
        .and_then(|p| p.file.as_deref())
        .and_then(|f| std::fs::read_to_string(f).ok());
    if let Some(source) = source {
        d = d.with_source(source);
    }
    if options.json {
        eprintln!("{}", json::render(&d));
    } else {
        eprint!("{}", AnsiRenderer { use_color: options.color }.render(&d));
    }
}

fn explain(code: &str) -> ExitCode {
    match registry::lookup(code) {
        Some(entry) => {
            print!("{}", entry.long);
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("Unknown error code '{code}'");
            ExitCode::FAILURE
        }
    }
}

fn run_files(cli: &Cli) -> ExitCode {
    let options = cli.options();
    let config = RuntimeConfig { heap_limit: options.heap_limit, cancel: signal::install(), io: Io::stdio() };
    let mut rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            report(&e, &options);
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = std::io::stdout().lock();
    let mut status = ExitCode::SUCCESS;
    for file in &cli.files {
        debug!(file = %file.display(), "running");
        if let Err(e) = run::run(&mut rt, file, &options, &mut stdout) {
            debug!(file = %file.display(), code = %e.code, "run failed");
            report(&e, &options);
            status = ExitCode::FAILURE;
            break;
        }
    }
    rt.teardown();
    status
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Some(code) = &cli.explain {
        return explain(code);
    }

    run_files(&cli)
}
