use std::fmt;
use std::rc::Rc;

use serde::Serialize;

/// Broad error category. The numeric value is what extensions pass through
/// `HostApi::error_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Bytecode,
    Internal,
    /// Unwinds an include expansion; never printed.
    Break,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::Syntax => 0,
            ErrorKind::Runtime => 1,
            ErrorKind::Bytecode => 2,
            ErrorKind::Internal => 3,
            ErrorKind::Break => 100,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ErrorKind::Syntax,
            1 => ErrorKind::Runtime,
            2 => ErrorKind::Bytecode,
            3 => ErrorKind::Internal,
            100 => ErrorKind::Break,
            _ => return None,
        })
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "Syntax Error",
            ErrorKind::Runtime => "Runtime Error",
            ErrorKind::Bytecode => "Bytecode Error",
            ErrorKind::Internal => "Internal Error",
            ErrorKind::Break => "Break",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    Unimplemented,
    UnknownChar,
    ExpectedChar,
    ExpectedToken,
    BytecodeUnimplemented,
    IncludeCycle,
    IdataOverflow,
    IllegalOperation,
    Memory,
    InvalidType,
    UnknownFd,
    UndefinedName,
    KeyboardInterrupt,
    NoFile,
    InvalidValue,
    InvalidPointer,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 16] = [
        ErrorCode::Unimplemented,
        ErrorCode::UnknownChar,
        ErrorCode::ExpectedChar,
        ErrorCode::ExpectedToken,
        ErrorCode::BytecodeUnimplemented,
        ErrorCode::IncludeCycle,
        ErrorCode::IdataOverflow,
        ErrorCode::IllegalOperation,
        ErrorCode::Memory,
        ErrorCode::InvalidType,
        ErrorCode::UnknownFd,
        ErrorCode::UndefinedName,
        ErrorCode::KeyboardInterrupt,
        ErrorCode::NoFile,
        ErrorCode::InvalidValue,
        ErrorCode::InvalidPointer,
    ];

    pub fn number(self) -> u32 {
        match self {
            ErrorCode::Unimplemented => 0,
            ErrorCode::UnknownChar => 100,
            ErrorCode::ExpectedChar => 101,
            ErrorCode::ExpectedToken => 250,
            ErrorCode::BytecodeUnimplemented => 300,
            ErrorCode::IncludeCycle => 301,
            ErrorCode::IdataOverflow => 302,
            ErrorCode::IllegalOperation => 400,
            ErrorCode::Memory => 401,
            ErrorCode::InvalidType => 402,
            ErrorCode::UnknownFd => 403,
            ErrorCode::UndefinedName => 404,
            ErrorCode::KeyboardInterrupt => 405,
            ErrorCode::NoFile => 406,
            ErrorCode::InvalidValue => 407,
            ErrorCode::InvalidPointer => 408,
        }
    }

    pub fn from_number(n: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.number() == n)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:03}", self.number())
    }
}

/// Line/column (1-based) plus the file the node came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
    pub file: Option<Rc<str>>,
}

impl SourcePos {
    pub fn new(line: u32, column: u32, file: Option<Rc<str>>) -> Self {
        SourcePos { line, column, file }
    }

    pub fn file_name(&self) -> &str {
        self.file.as_deref().unwrap_or("<unknown>")
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File '{}', Line {}, Column {}", self.file_name(), self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} ({code}): {message}")]
pub struct MangoError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub pos: Option<SourcePos>,
    /// Include site when the error was detected inside an included file.
    pub outer: Option<SourcePos>,
}

pub type MangoResult<T> = Result<T, MangoError>;

impl MangoError {
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>) -> Self {
        MangoError { kind, code, message: message.into(), pos: None, outer: None }
    }

    pub fn syntax(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, code, message)
    }

    pub fn runtime(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, code, message)
    }

    pub fn bytecode(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bytecode, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, ErrorCode::Unimplemented, message)
    }

    pub fn illegal(message: impl Into<String>) -> Self {
        Self::runtime(ErrorCode::IllegalOperation, message)
    }

    pub fn mismatched_types() -> Self {
        Self::illegal("Mismatched types")
    }

    pub fn undefined(name: &str) -> Self {
        Self::runtime(ErrorCode::UndefinedName, format!("Undefined name '{name}'"))
    }

    pub fn include_break(file: &str) -> Self {
        Self::new(ErrorKind::Break, ErrorCode::IncludeCycle, format!("'{file}' is already being included"))
    }

    /// Attaches `pos` unless a position was already recorded closer to the fault.
    pub fn at(mut self, pos: &SourcePos) -> Self {
        if self.pos.is_none() {
            self.pos = Some(pos.clone());
        }
        self
    }

    pub fn at_opt(self, pos: Option<&SourcePos>) -> Self {
        match pos {
            Some(p) => self.at(p),
            None => self,
        }
    }

    pub fn with_outer(mut self, pos: &SourcePos) -> Self {
        if self.outer.is_none() {
            self.outer = Some(pos.clone());
        }
        self
    }

    pub fn is_break(&self) -> bool {
        self.kind == ErrorKind::Break
    }

    /// The one-line header the driver prints before the message.
    pub fn headline(&self) -> String {
        match &self.pos {
            Some(pos) => format!("{} ({})", self.kind, pos),
            None => self.kind.to_string(),
        }
    }
}
