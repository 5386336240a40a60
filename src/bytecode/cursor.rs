use std::rc::Rc;

use crate::error::{ErrorCode, MangoError, MangoResult, SourcePos};

use super::format::*;
use super::program::Program;

/// Forward-only reader over a [`Program`]. Opcode handlers consume their
/// payload through it and never touch raw offsets.
#[derive(Clone)]
pub struct Cursor {
    program: Rc<Program>,
    pos: usize,
}

fn truncated() -> MangoError {
    MangoError::bytecode(ErrorCode::InvalidValue, "Unexpected end of bytecode")
}

impl Cursor {
    pub fn new(program: Rc<Program>, pos: usize) -> Self {
        Cursor { program, pos }
    }

    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn skip(&mut self, n: usize) -> MangoResult<()> {
        if self.pos + n > self.program.len() {
            return Err(truncated());
        }
        self.pos += n;
        Ok(())
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.program.len()
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.program.bytes().get(self.pos).copied()
    }

    pub fn read_u8(&mut self) -> MangoResult<u8> {
        let b = self.peek_u8().ok_or_else(truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u32(&mut self) -> MangoResult<u32> {
        let bytes = self.program.bytes().get(self.pos..self.pos + 4).ok_or_else(truncated)?;
        let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.pos += 4;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> MangoResult<i32> {
        self.read_u32().map(|v| v as i32)
    }

    /// Bytes up to the next NUL; the NUL is consumed.
    pub fn read_cstr(&mut self) -> MangoResult<Vec<u8>> {
        let rest = self.program.bytes().get(self.pos..).ok_or_else(truncated)?;
        let len = rest.iter().position(|&b| b == 0).ok_or_else(truncated)?;
        let bytes = rest[..len].to_vec();
        self.pos += len + 1;
        Ok(bytes)
    }

    fn expect(&mut self, signature: u8, what: &str) -> MangoResult<()> {
        let found = self.read_u8()?;
        if found != signature {
            return Err(MangoError::bytecode(
                ErrorCode::InvalidValue,
                format!("expected {what} at offset {}, found {found:#04x}", self.pos - 1),
            ));
        }
        Ok(())
    }

    pub fn read_ident(&mut self) -> MangoResult<String> {
        self.expect(SIG_IDENT, "an identifier")?;
        let bytes = self.read_cstr()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// A dotted name: 4-byte count, then that many identifiers.
    pub fn read_path(&mut self) -> MangoResult<Vec<String>> {
        let count = self.read_u32()?;
        (0..count).map(|_| self.read_ident()).collect()
    }

    /// String literal payload after its `0x9E` signature, resolving idata
    /// indices when the program uses a string table.
    pub fn read_string_payload(&mut self) -> MangoResult<Rc<[u8]>> {
        if self.program.uses_idata() {
            let index = self.read_u8()?;
            return self.program.idata(index);
        }
        self.read_cstr().map(Rc::from)
    }

    /// Consumes a position marker if one starts here.
    pub fn read_pos(&mut self, file: Option<&Rc<str>>) -> MangoResult<Option<SourcePos>> {
        if self.peek_u8() != Some(MARK_POS) {
            return Ok(None);
        }
        self.pos += 1;
        let line = self.read_u32()?;
        let column = self.read_u32()?;
        Ok(Some(SourcePos::new(line, column, file.cloned())))
    }

    /// Decodes a position marker at `offset` without moving the cursor.
    pub fn peek_pos_at(&self, offset: usize, file: Option<&Rc<str>>) -> Option<SourcePos> {
        let mut probe = Cursor::new(Rc::clone(&self.program), offset);
        probe.read_pos(file).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(body: &[u8]) -> Rc<Program> {
        let mut bytes = vec![0x0B, b'm', b'c', 0x0E, 0, 0, 0, 0];
        bytes.extend_from_slice(body);
        Program::load(bytes, "t.mc").unwrap()
    }

    #[test]
    fn reads_typed_values() {
        let p = program(&[0x00, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFE, 0x9F, b'a', b'b', 0x00]);
        let mut c = Cursor::new(p, HEADER_LEN);
        assert_eq!(c.read_u32().unwrap(), 256);
        assert_eq!(c.read_i32().unwrap(), -2);
        assert_eq!(c.read_ident().unwrap(), "ab");
        assert!(c.at_end());
        assert_eq!(c.read_u8().unwrap_err().message, "Unexpected end of bytecode");
    }

    #[test]
    fn path_of_two() {
        let p = program(&[0, 0, 0, 2, 0x9F, b'p', 0, 0x9F, b'x', 0]);
        let mut c = Cursor::new(p, HEADER_LEN);
        assert_eq!(c.read_path().unwrap(), ["p", "x"]);
    }

    #[test]
    fn position_marker_is_optional() {
        let p = program(&[0xFE, 0, 0, 0, 3, 0, 0, 0, 7, 0x9B]);
        let mut c = Cursor::new(p, HEADER_LEN);
        let file: Rc<str> = "a.mg".into();
        assert_eq!(c.peek_pos_at(HEADER_LEN, Some(&file)).unwrap().line, 3);
        assert_eq!(c.position(), HEADER_LEN);
        let pos = c.read_pos(Some(&file)).unwrap().unwrap();
        assert_eq!((pos.line, pos.column), (3, 7));
        assert!(c.read_pos(None).unwrap().is_none());
        assert_eq!(c.read_u8().unwrap(), 0x9B);
    }

    #[test]
    fn unterminated_string_is_truncation() {
        let p = program(&[0x9F, b'a', b'b']);
        let mut c = Cursor::new(p, HEADER_LEN);
        assert!(c.read_ident().is_err());
    }
}
