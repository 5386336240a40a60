//! The mango toolchain: lexer, parser, bytecode compiler, byte-offset VM,
//! refcounted object model and dynamic extension loader.

pub mod ast;
pub mod bytecode;
pub mod diagnostic;
pub mod dynload;
pub mod error;
pub mod interpreter;
pub mod lexer;
pub mod names;
pub mod object;
pub mod parser;
pub mod run;
pub mod runtime;
pub mod signal;
pub mod vm;

pub use error::{ErrorCode, ErrorKind, MangoError, MangoResult, SourcePos};
pub use run::{Outcome, RunMode, RunOptions};
pub use runtime::{Runtime, RuntimeConfig};
