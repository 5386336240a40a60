use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::ast::{DeclSpec, Node, NodeKind, TypeSpec};
use crate::error::{ErrorCode, MangoError, MangoResult, SourcePos};
use crate::parser;

use super::format::*;

/// What the emitted stream is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytecodeMode {
    /// Compiled and run in memory.
    Execute,
    /// Written out as a runnable `.mc` file.
    Executable,
    /// Written out as a `.ml` library, only runnable through a library reference.
    Library,
}

impl BytecodeMode {
    fn header(self) -> (u8, u8) {
        match self {
            BytecodeMode::Library => (MODE_LIBRARY, CONFIRM_LIBRARY),
            _ => (MODE_EXECUTABLE, CONFIRM_EXECUTABLE),
        }
    }
}

/// Reads the text of an included file.
pub trait SourceLoader {
    fn load(&self, path: &Path) -> MangoResult<String>;
}

/// Loads includes from disk.
pub struct FsLoader;

impl SourceLoader for FsLoader {
    fn load(&self, path: &Path) -> MangoResult<String> {
        let bytes = crate::run::read_all(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

// ── String table ────────────────────────────────────────────────────

/// Deduplicated string literals, indexed by a single byte.
#[derive(Debug, Default)]
pub struct IdataTable {
    entries: Vec<Vec<u8>>,
}

impl IdataTable {
    /// Index of `bytes`, appending it on first sight.
    pub fn intern(&mut self, bytes: &[u8]) -> MangoResult<u8> {
        if let Some(i) = self.entries.iter().position(|e| e == bytes) {
            return Ok(i as u8);
        }
        if self.entries.len() >= IDATA_CAPACITY {
            return Err(MangoError::bytecode(
                ErrorCode::IdataOverflow,
                format!("More than {IDATA_CAPACITY} distinct string literals in one file"),
            ));
        }
        self.entries.push(bytes.to_vec());
        Ok((self.entries.len() - 1) as u8)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends the `0xFD` table and its payloads to `buf`; offsets are absolute.
    fn write(&self, buf: &mut Vec<u8>) {
        buf.push(MARK_IDATA);
        let mut offset = buf.len() + self.entries.len() * IDATA_ENTRY_LEN;
        for (i, entry) in self.entries.iter().enumerate() {
            buf.push(i as u8);
            buf.push(SIG_INT);
            buf.extend_from_slice(&(offset as u32).to_be_bytes());
            offset += entry.len() + 2;
        }
        for entry in &self.entries {
            buf.push(SIG_STRING);
            buf.extend_from_slice(entry);
            buf.push(0);
        }
    }
}

// ── Compiler ────────────────────────────────────────────────────────

pub struct Compiler<'a> {
    buf: Vec<u8>,
    mode: BytecodeMode,
    idata: Option<IdataTable>,
    libraries: Vec<String>,
    /// File named by the most recent file marker.
    emitted_file: Option<Rc<str>>,
    /// Files currently being expanded, outermost first.
    includes: Vec<PathBuf>,
    loader: &'a dyn SourceLoader,
}

/// Compiles `root` with includes read from disk and no library references.
pub fn compile(root: &Node, mode: BytecodeMode, idata: bool) -> MangoResult<Vec<u8>> {
    Compiler::new(mode, &FsLoader).with_idata(idata).compile(root)
}

impl<'a> Compiler<'a> {
    pub fn new(mode: BytecodeMode, loader: &'a dyn SourceLoader) -> Self {
        Compiler {
            buf: Vec::new(),
            mode,
            idata: None,
            libraries: Vec::new(),
            emitted_file: None,
            includes: Vec::new(),
            loader,
        }
    }

    pub fn with_idata(mut self, enabled: bool) -> Self {
        self.idata = enabled.then(IdataTable::default);
        self
    }

    pub fn with_libraries(mut self, libraries: Vec<String>) -> Self {
        self.libraries = libraries;
        self
    }

    pub fn compile(mut self, root: &Node) -> MangoResult<Vec<u8>> {
        let (mode, confirm) = self.mode.header();
        let flags = if self.idata.is_some() { FLAG_IDATA } else { 0 };
        self.buf.extend_from_slice(&MAGIC);
        self.buf.extend_from_slice(&[mode, confirm, 0, 0, 0, flags]);

        for lib in std::mem::take(&mut self.libraries) {
            self.buf.push(MARK_LIBRARY);
            self.ident(&lib);
        }

        if let Some(file) = root.pos.file.as_deref() {
            debug!(file, mode = ?self.mode, "compiling");
            self.includes.push(PathBuf::from(file));
        }
        let count = self.statements(root.statements())?;

        if let Some(table) = self.idata.take() {
            debug!(strings = table.len(), "writing idata table");
            table.write(&mut self.buf);
        }
        self.buf.push(MARK_END);
        debug!(instructions = count, bytes = self.buf.len(), "compiled");
        Ok(self.buf)
    }

    fn statements(&mut self, body: &[Node]) -> MangoResult<u32> {
        let mut count = 0;
        for node in body {
            count += self.node(node)?;
        }
        Ok(count)
    }

    /// Emits one node; returns how many top-level instructions it produced
    /// (includes and nested statement lists can produce several).
    fn node(&mut self, node: &Node) -> MangoResult<u32> {
        match &node.kind {
            NodeKind::Statements { body } => return self.statements(body),
            NodeKind::Include { file } => return self.include(file, &node.pos),
            NodeKind::Else { .. } => {
                return Err(MangoError::bytecode(ErrorCode::BytecodeUnimplemented, "'else' outside of an 'if'")
                    .at(&node.pos));
            }
            _ => {}
        }

        self.file_marker(&node.pos);
        match &node.kind {
            NodeKind::Int { value } => {
                self.buf.push(SIG_INT);
                self.buf.extend_from_slice(&value.to_be_bytes());
            }
            NodeKind::Str { value } => self.string(value.as_bytes())?,
            NodeKind::VarAccess { path } => self.path_op(Opcode::VarAccess, path, node),
            NodeKind::Inc { path } => self.path_op(Opcode::Inc, path, node),
            NodeKind::Dec { path } => self.path_op(Opcode::Dec, path, node),
            NodeKind::GetItem { path, index } => {
                self.op(Opcode::GetItem);
                self.path(path);
                self.node(index)?;
                self.pos(&node.pos);
            }
            NodeKind::VarAssign { path, value } => {
                self.op(Opcode::VarAssign);
                self.path(path);
                self.node(value)?;
                self.pos(&node.pos);
            }
            NodeKind::SetItem { path, index, value } => {
                self.op(Opcode::SetItem);
                self.path(path);
                self.node(index)?;
                self.node(value)?;
                self.pos(&node.pos);
            }
            NodeKind::UnOp { op, operand } => {
                self.op(Opcode::UnOp);
                self.buf.push(*op as u8);
                self.node(operand)?;
                self.pos(&node.pos);
            }
            NodeKind::BinOp { op, lhs, rhs } => {
                self.op(Opcode::BinOp);
                self.buf.push(*op as u8);
                self.node(lhs)?;
                self.node(rhs)?;
                self.pos(&node.pos);
            }
            NodeKind::VarNew { decl, size, value } => {
                self.op(Opcode::VarNew);
                self.decl(decl, DECL_HAS_INIT);
                if let Some(size) = size {
                    self.node(size)?;
                }
                self.node(value)?;
                self.pos(&node.pos);
            }
            NodeKind::VarUn { decl, size } => {
                self.op(Opcode::VarUn);
                self.decl(decl, 0);
                if let Some(size) = size {
                    self.node(size)?;
                }
                self.pos(&node.pos);
            }
            NodeKind::Call { callee, args } => {
                self.op(Opcode::Call);
                self.node(callee)?;
                self.u32(args.len() as u32);
                for arg in args {
                    self.node(arg)?;
                }
                self.pos(&node.pos);
            }
            NodeKind::FuncDec { ret, name, params } => {
                self.op(Opcode::FuncDec);
                self.type_spec(ret);
                self.ident(name);
                self.u32(params.len() as u32);
                for p in params {
                    self.type_spec(&p.ty);
                    self.ident(&p.name);
                }
                self.pos(&node.pos);
            }
            NodeKind::FuncDef { decl, body } => {
                self.op(Opcode::FuncDef);
                self.node(decl)?;
                self.block(body, None)?;
                self.pos(&node.pos);
            }
            NodeKind::If { cond, body, otherwise } => {
                self.op(Opcode::If);
                self.node(cond)?;
                self.block(body, None)?;
                if let Some(other) = otherwise {
                    let NodeKind::Else { body } = &other.kind else {
                        return Err(MangoError::bytecode(ErrorCode::BytecodeUnimplemented, "malformed 'else' branch")
                            .at(&other.pos));
                    };
                    self.op(Opcode::Else);
                    self.block(body, None)?;
                }
                self.pos(&node.pos);
            }
            NodeKind::While { cond, body } => {
                self.op(Opcode::While);
                self.node(cond)?;
                self.block(body, None)?;
                self.pos(&node.pos);
            }
            NodeKind::For { init, cond, step, body } => {
                self.op(Opcode::For);
                self.node(init)?;
                self.node(cond)?;
                self.block(body, Some(step))?;
                self.pos(&node.pos);
            }
            NodeKind::Return { value } => {
                self.op(Opcode::Return);
                self.node(value)?;
                self.pos(&node.pos);
            }
            NodeKind::Extern { inner } => {
                self.op(Opcode::Extern);
                self.node(inner)?;
            }
            NodeKind::Const { inner } => {
                self.op(Opcode::Const);
                self.node(inner)?;
            }
            NodeKind::Unsigned { inner } => {
                self.op(Opcode::Unsigned);
                self.node(inner)?;
            }
            NodeKind::Struct { name, members } => {
                self.op(Opcode::Struct);
                self.ident(name);
                let count_at = self.placeholder();
                let count = self.statements(members)?;
                self.patch(count_at, count);
                self.pos(&node.pos);
            }
            NodeKind::Typedef { base, name } => {
                self.op(Opcode::Typedef);
                self.type_spec(base);
                self.ident(name);
                self.pos(&node.pos);
            }
            NodeKind::Statements { .. } | NodeKind::Include { .. } | NodeKind::Else { .. } => {}
        }
        Ok(1)
    }

    /// Inlines another source file. A file already being expanded ends the
    /// expansion silently.
    fn include(&mut self, file: &str, at: &SourcePos) -> MangoResult<u32> {
        let path = match at.file.as_deref().and_then(|f| Path::new(f).parent()) {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(file),
            _ => PathBuf::from(file),
        };
        let result = self.expand(&path, at);
        match result {
            Err(e) if e.is_break() => {
                debug!(file = %path.display(), "include cycle, skipping");
                Ok(0)
            }
            other => other,
        }
    }

    fn expand(&mut self, path: &Path, at: &SourcePos) -> MangoResult<u32> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.includes.iter().any(|p| p.canonicalize().unwrap_or_else(|_| p.clone()) == key) {
            return Err(MangoError::include_break(&path.display().to_string()));
        }
        debug!(file = %path.display(), "including");
        let source = self.loader.load(path).map_err(|e| e.at(at))?;
        let name = path.display().to_string();
        let root = parser::parse_source(&source, Some(&name)).map_err(|e| e.with_outer(at))?;

        self.includes.push(key);
        let result = self.statements(root.statements()).map_err(|e| e.with_outer(at));
        self.includes.pop();
        result
    }

    // ── Emission helpers ────────────────────────────────────────────

    fn op(&mut self, op: Opcode) {
        self.buf.push(op.byte());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn placeholder(&mut self) -> usize {
        let at = self.buf.len();
        self.u32(0);
        at
    }

    fn patch(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn ident(&mut self, name: &str) {
        self.buf.push(SIG_IDENT);
        self.cstr(name.as_bytes());
    }

    fn cstr(&mut self, bytes: &[u8]) {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        self.buf.extend_from_slice(&bytes[..end]);
        self.buf.push(0);
    }

    fn string(&mut self, bytes: &[u8]) -> MangoResult<()> {
        self.buf.push(SIG_STRING);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        match self.idata.as_mut() {
            Some(table) => {
                let index = table.intern(&bytes[..end])?;
                self.buf.push(index);
            }
            None => self.cstr(bytes),
        }
        Ok(())
    }

    fn path(&mut self, path: &[String]) {
        self.u32(path.len() as u32);
        for name in path {
            self.ident(name);
        }
    }

    fn path_op(&mut self, op: Opcode, path: &[String], node: &Node) {
        self.op(op);
        self.path(path);
        self.pos(&node.pos);
    }

    fn type_spec(&mut self, ty: &TypeSpec) {
        self.buf.push(ty.pointer as u8);
        self.ident(&ty.name);
    }

    fn decl(&mut self, decl: &DeclSpec, flags: u8) {
        let mut flags = flags;
        if decl.array {
            flags |= DECL_ARRAY;
        }
        if decl.ty.pointer {
            flags |= DECL_POINTER;
        }
        self.buf.push(flags);
        self.ident(&decl.ty.name);
        self.ident(&decl.name);
    }

    fn pos(&mut self, pos: &SourcePos) {
        self.buf.push(MARK_POS);
        self.u32(pos.line);
        self.u32(pos.column);
    }

    fn file_marker(&mut self, pos: &SourcePos) {
        if pos.file.is_some() && pos.file != self.emitted_file {
            self.buf.push(MARK_FILE);
            self.ident(pos.file.as_deref().unwrap_or_default());
            self.emitted_file = pos.file.clone();
        }
    }

    /// `count len body [trailer]`; `len` covers the trailer too.
    fn block(&mut self, body: &[Node], trailer: Option<&Node>) -> MangoResult<()> {
        let count_at = self.placeholder();
        let len_at = self.placeholder();
        let start = self.buf.len();
        let file_before = self.emitted_file.clone();
        let count = self.statements(body)?;
        if let Some(step) = trailer {
            self.node(step)?;
        }
        self.patch(count_at, count);
        self.patch(len_at, (self.buf.len() - start) as u32);
        // A skipped body may have switched files; make the next node restate it.
        if self.emitted_file != file_before {
            self.emitted_file = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::bytecode::Program;

    struct MemLoader(HashMap<PathBuf, String>);

    impl SourceLoader for MemLoader {
        fn load(&self, path: &Path) -> MangoResult<String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| MangoError::runtime(ErrorCode::NoFile, format!("Could not open file '{}'", path.display())))
        }
    }

    fn compile_src(src: &str, idata: bool) -> Vec<u8> {
        let root = parser::parse_source(src, None).unwrap();
        compile(&root, BytecodeMode::Execute, idata).unwrap()
    }

    #[test]
    fn one_plus_two() {
        let bytes = compile_src("1 + 2;", false);
        let mut want = vec![0x0B, b'm', b'c', 0x0E, 0, 0, 0, 0];
        want.extend([0x9D, 0x00, 0x9B, 0, 0, 0, 1, 0x9B, 0, 0, 0, 2, 0xFE, 0, 0, 0, 1, 0, 0, 0, 3, 0x00]);
        assert_eq!(bytes, want);
    }

    #[test]
    fn library_header() {
        let root = parser::parse_source("1;", None).unwrap();
        let bytes = compile(&root, BytecodeMode::Library, false).unwrap();
        assert_eq!(&bytes[..8], &[0x0B, b'm', b'l', 0x0F, 0, 0, 0, 0]);
    }

    #[test]
    fn idata_dedups_literals() {
        let bytes = compile_src("\"hi\"; \"hi\"; \"yo\";", true);
        assert_eq!(bytes[7], FLAG_IDATA);
        assert_eq!(&bytes[8..14], &[0x9E, 0x00, 0x9E, 0x00, 0x9E, 0x01]);
        let program = Program::load(bytes, "t.mc").unwrap();
        assert_eq!(program.idata_len(), 2);
        assert_eq!(&*program.idata(0).unwrap(), b"hi");
        assert_eq!(&*program.idata(1).unwrap(), b"yo");
    }

    #[test]
    fn idata_overflow_is_an_error() {
        let mut table = IdataTable::default();
        for i in 0..IDATA_CAPACITY {
            table.intern(i.to_string().as_bytes()).unwrap();
        }
        assert_eq!(table.intern(b"0").unwrap(), 0);
        assert_eq!(table.intern(b"one too many").unwrap_err().code, ErrorCode::IdataOverflow);
    }

    #[test]
    fn block_length_covers_body() {
        let bytes = compile_src("if (1) -> [ 2; 3; ]", false);
        // D8, cond (5 bytes), count, len
        assert_eq!(bytes[8], 0xD8);
        assert_eq!(&bytes[14..18], &[0, 0, 0, 2]);
        assert_eq!(&bytes[18..22], &[0, 0, 0, 10]);
        assert_eq!(bytes[32], MARK_POS);
    }

    #[test]
    fn library_references_lead_the_stream() {
        let root = parser::parse_source("1;", None).unwrap();
        let bytes = Compiler::new(BytecodeMode::Executable, &FsLoader)
            .with_libraries(vec!["std.ml".into()])
            .compile(&root)
            .unwrap();
        assert_eq!(&bytes[8..17], &[0xE0, 0x9F, b's', b't', b'd', b'.', b'm', b'l', 0]);
    }

    #[test]
    fn includes_are_inlined_and_counted() {
        let mut files = HashMap::new();
        files.insert(PathBuf::from("lib/b.mg"), "int y = 2; y;".to_string());
        let loader = MemLoader(files);
        let root = parser::parse_source("fun int f() -> [ include 'b.mg'; ]", Some("lib/a.mg")).unwrap();
        let bytes = Compiler::new(BytecodeMode::Execute, &loader).compile(&root).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("lib/b.mg"), "file marker for the included file");
        let count_at = bytes.iter().position(|&b| b == 0xDC).unwrap();
        // the funcdec follows 0xDC; the body count comes right after its position marker
        let dec_end = bytes[count_at..].iter().position(|&b| b == MARK_POS).unwrap() + count_at + 9;
        assert_eq!(&bytes[dec_end..dec_end + 4], &[0, 0, 0, 2]);
    }

    #[test]
    fn include_cycle_stops_silently() {
        let mut files = HashMap::new();
        files.insert(PathBuf::from("a.mg"), "include 'a.mg'; 1;".to_string());
        let loader = MemLoader(files);
        let root = parser::parse_source("include 'a.mg';", Some("a.mg")).unwrap();
        assert!(Compiler::new(BytecodeMode::Execute, &loader).compile(&root).is_ok());
    }

    #[test]
    fn missing_include_is_nofile() {
        let loader = MemLoader(HashMap::new());
        let root = parser::parse_source("include 'gone.mg';", Some("a.mg")).unwrap();
        let err = Compiler::new(BytecodeMode::Execute, &loader).compile(&root).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoFile);
        assert_eq!(err.pos.unwrap().line, 1);
    }

    #[test]
    fn stray_else_is_unimplemented() {
        let node = Node::new(NodeKind::Else { body: vec![] }, SourcePos::new(1, 1, None));
        let root = Node::new(NodeKind::Statements { body: vec![node] }, SourcePos::default());
        let err = compile(&root, BytecodeMode::Execute, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::BytecodeUnimplemented);
    }
}
