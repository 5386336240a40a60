//! Binary program format: compiler, loader and reader.

pub mod compiler;
pub mod cursor;
pub mod format;
pub mod hexdump;
pub mod program;

pub use compiler::{BytecodeMode, Compiler, FsLoader, IdataTable, SourceLoader, compile};
pub use cursor::Cursor;
pub use format::Opcode;
pub use hexdump::hexdump;
pub use program::Program;
