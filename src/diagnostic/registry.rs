use crate::error::ErrorCode;

/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: ErrorCode,
    pub short: &'static str,
    pub long: &'static str,
}

/// Every stable error code, with the text `--explain` prints.
pub static REGISTRY: &[ErrorEntry] = &[
    ErrorEntry {
        code: ErrorCode::Unimplemented,
        short: "unimplemented feature",
        long: r#"## E000: unimplemented feature

The toolchain reached a construct it does not support yet, or an
internal invariant broke. This is not caused by the program itself.
"#,
    },
    // ── Syntax ───────────────────────────────────────────────────────────────
    ErrorEntry {
        code: ErrorCode::UnknownChar,
        short: "unknown character",
        long: r#"## E100: unknown character

The lexer met a character that cannot start any token.

**Example:**

    int x = 3 @ 4;

`@` is not an operator. Remove it or replace it with a valid one.
"#,
    },
    ErrorEntry {
        code: ErrorCode::ExpectedChar,
        short: "expected a character",
        long: r#"## E101: expected a character

A specific character was required, most often the `;` that ends a
statement or the `]` that closes a block.

**Example:**

    int x = 1
    int y = 2;

Add `;` after `1`.
"#,
    },
    ErrorEntry {
        code: ErrorCode::ExpectedToken,
        short: "unexpected token",
        long: r#"## E250: unexpected token

The parser expected a different kind of token here: an identifier after
a type, `(` after `if`, a file name after `include`, and so on. The
message names what was expected and what was found.
"#,
    },
    // ── Bytecode ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: ErrorCode::BytecodeUnimplemented,
        short: "construct cannot be compiled",
        long: r#"## E300: construct cannot be compiled

The compiler met a node it has no encoding for in that position, such
as an `else` that does not follow an `if`.
"#,
    },
    ErrorEntry {
        code: ErrorCode::IncludeCycle,
        short: "include cycle",
        long: r#"## E301: include cycle

A file includes itself, directly or through other files. The repeated
include is skipped, so this code is never reported on its own.
"#,
    },
    ErrorEntry {
        code: ErrorCode::IdataOverflow,
        short: "too many distinct strings",
        long: r#"## E302: too many distinct strings

With `--idata`, string literals are pooled into a table addressed by a
single byte, so a program can hold at most 256 distinct strings.
Compile without `--idata` or merge some literals.
"#,
    },
    // ── Runtime ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: ErrorCode::IllegalOperation,
        short: "illegal operation",
        long: r#"## E400: illegal operation

An operation was applied to values it is not defined for: adding two
strings, dividing by zero, indexing past the end of an array, assigning
to a `const`, calling something that is not a function, or mixing
types in an assignment or call ("Mismatched types").

**Example:**

    "ab" + "cd";

Strings are `*chr` pointers; `+` is not defined between two pointers.
"#,
    },
    ErrorEntry {
        code: ErrorCode::Memory,
        short: "out of memory",
        long: r#"## E401: out of memory

An allocation failed. Either the live object limit given with
`--heap-limit` was reached or the call stack grew past its maximum
depth, usually through unbounded recursion.
"#,
    },
    ErrorEntry {
        code: ErrorCode::InvalidType,
        short: "invalid type",
        long: r#"## E402: invalid type

A type name does not resolve, or a value of the wrong type was used
where a specific one is required (an array size must be an `int`).

**Example:**

    float f = 1;

There is no `float` type. Declare it with `typedef` or `struct` first.
"#,
    },
    ErrorEntry {
        code: ErrorCode::UnknownFd,
        short: "unknown file descriptor",
        long: r#"## E403: unknown file descriptor

`write` only accepts 1 (stdout) and 2 (stderr); `read` only accepts 0
(stdin).
"#,
    },
    ErrorEntry {
        code: ErrorCode::UndefinedName,
        short: "undefined name",
        long: r#"## E404: undefined name

A name was used that no enclosing scope defines, a function was called
that was declared but never given a body, or a symbol is missing from
a dynamic extension.

**Example:**

    fun int later();
    later();
"#,
    },
    ErrorEntry {
        code: ErrorCode::KeyboardInterrupt,
        short: "interrupted",
        long: r#"## E405: interrupted

Ctrl-C was pressed while a loop was running. The interrupt is observed
at the end of the current iteration.
"#,
    },
    ErrorEntry {
        code: ErrorCode::NoFile,
        short: "file not found",
        long: r#"## E406: file not found

A source file, bytecode file, library or dynamic extension could not be
opened or read. Check the path; includes are resolved relative to the
including file.
"#,
    },
    ErrorEntry {
        code: ErrorCode::InvalidValue,
        short: "invalid value",
        long: r#"## E407: invalid value

A value is outside the range an operation accepts: a negative array
size, an extension handle that was never returned by `dlopen`, an
unknown opcode in a bytecode file, or a failing extension initialiser.
"#,
    },
    ErrorEntry {
        code: ErrorCode::InvalidPointer,
        short: "invalid pointer",
        long: r#"## E408: invalid pointer

A null pointer was dereferenced or passed where a buffer is required,
or a function from a closed extension library was called.
"#,
    },
];

/// Look up an entry by its printed code; `"E404"`, `"e404"` and `"404"`
/// all name the same entry.
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    let digits = code.strip_prefix(['E', 'e']).unwrap_or(code);
    let number = digits.parse::<u32>().ok()?;
    let code = ErrorCode::from_number(number)?;
    REGISTRY.iter().find(|e| e.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_code() {
        let e = lookup("E404").expect("E404 should be in registry");
        assert_eq!(e.code, ErrorCode::UndefinedName);
        assert!(e.long.contains("E404"));
        assert_eq!(lookup("404").map(|e| e.code), Some(ErrorCode::UndefinedName));
        assert_eq!(lookup("e100").map(|e| e.code), Some(ErrorCode::UnknownChar));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("E999").is_none());
        assert!(lookup("").is_none());
        assert!(lookup("Ex").is_none());
    }

    #[test]
    fn every_entry_explains_its_own_code() {
        let mut seen = Vec::new();
        for entry in REGISTRY {
            assert!(!seen.contains(&entry.code), "duplicate {}", entry.code);
            seen.push(entry.code);
            assert!(!entry.short.is_empty());
            assert!(entry.long.contains(&entry.code.to_string()), "{} text names another code", entry.code);
        }
        assert_eq!(seen.len(), 16);
    }
}
