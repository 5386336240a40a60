use std::rc::Rc;

use tracing::debug;

use crate::error::{ErrorCode, MangoError, MangoResult};

use super::format::*;

/// A validated bytecode image plus its resolved string table.
pub struct Program {
    name: Rc<str>,
    bytes: Vec<u8>,
    library: bool,
    flags: u8,
    idata: Vec<Option<Rc<[u8]>>>,
    idata_offset: Option<usize>,
}

fn malformed(msg: impl Into<String>) -> MangoError {
    MangoError::bytecode(ErrorCode::InvalidValue, msg)
}

impl Program {
    pub fn load(bytes: Vec<u8>, name: &str) -> MangoResult<Rc<Program>> {
        if bytes.len() < HEADER_LEN + 1 || bytes[..2] != MAGIC {
            return Err(malformed(format!("'{name}' is not a bytecode file")));
        }
        let library = match (bytes[2], bytes[3]) {
            (MODE_EXECUTABLE, CONFIRM_EXECUTABLE) => false,
            (MODE_LIBRARY, CONFIRM_LIBRARY) => true,
            _ => return Err(malformed(format!("'{name}' has an invalid bytecode header"))),
        };
        let flags = bytes[7];
        let mut program = Program {
            name: Rc::from(name),
            bytes,
            library,
            flags,
            idata: Vec::new(),
            idata_offset: None,
        };
        if flags & FLAG_IDATA != 0 {
            program.load_idata()?;
        }
        Ok(Rc::new(program))
    }

    pub fn name(&self) -> &Rc<str> {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= HEADER_LEN
    }

    pub fn is_library(&self) -> bool {
        self.library
    }

    pub fn uses_idata(&self) -> bool {
        self.flags & FLAG_IDATA != 0
    }

    pub fn idata_offset(&self) -> Option<usize> {
        self.idata_offset
    }

    pub fn idata(&self, index: u8) -> MangoResult<Rc<[u8]>> {
        self.idata
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| malformed(format!("idata index {index} is not in the string table")))
    }

    pub fn idata_len(&self) -> usize {
        self.idata.iter().filter(|e| e.is_some()).count()
    }

    /// Finds the `0xFD` table. A candidate only counts when every entry points
    /// at a string payload and the last payload ends right before the sentinel.
    fn load_idata(&mut self) -> MangoResult<()> {
        let candidates: Vec<usize> = (HEADER_LEN..self.bytes.len())
            .filter(|&i| self.bytes[i] == MARK_IDATA)
            .collect();
        for at in candidates {
            if let Some(table) = parse_idata(&self.bytes, at) {
                debug!(program = %self.name, entries = table.len(), offset = at, "loaded idata table");
                self.idata = table;
                self.idata_offset = Some(at);
                return Ok(());
            }
        }
        Err(malformed(format!("'{}' declares a string table but none was found", self.name)))
    }
}

fn read_be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn parse_idata(bytes: &[u8], marker: usize) -> Option<Vec<Option<Rc<[u8]>>>> {
    let mut i = marker + 1;
    let mut table: Vec<Option<Rc<[u8]>>> = Vec::new();
    let mut table_end = None;
    let mut last_payload_end = i;

    while table_end.is_none_or(|end| i < end) {
        if bytes.get(i + 1) != Some(&SIG_INT) {
            break;
        }
        let index = bytes[i] as usize;
        let offset = read_be_u32(bytes, i + 2)? as usize;
        table_end.get_or_insert(offset);
        if bytes.get(offset) != Some(&SIG_STRING) {
            return None;
        }
        let len = bytes.get(offset + 1..)?.iter().position(|&b| b == 0)?;
        let payload: Rc<[u8]> = Rc::from(&bytes[offset + 1..offset + 1 + len]);
        if table.len() <= index {
            table.resize(index + 1, None);
        }
        table[index] = Some(payload);
        last_payload_end = last_payload_end.max(offset + 1 + len + 1);
        i += IDATA_ENTRY_LEN;
    }

    let sentinel = if table.is_empty() { i } else { last_payload_end };
    (sentinel + 1 == bytes.len() && bytes[sentinel] == MARK_END).then_some(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(mode: u8, confirm: u8, flags: u8) -> Vec<u8> {
        vec![0x0B, b'm', mode, confirm, 0, 0, 0, flags]
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(Program::load(vec![1, 2, 3, 4, 5, 6, 7, 8, 0], "x").is_err());
        let mut wrong_confirm = header(b'c', 0x0F, 0);
        wrong_confirm.push(0);
        assert!(Program::load(wrong_confirm, "x").is_err());
    }

    #[test]
    fn library_flag() {
        let mut bytes = header(b'l', 0x0F, 0);
        bytes.push(0);
        let p = Program::load(bytes, "lib.ml").unwrap();
        assert!(p.is_library());
        assert!(!p.uses_idata());
    }

    #[test]
    fn idata_table_resolves_strings() {
        let mut bytes = header(b'c', 0x0E, FLAG_IDATA);
        bytes.extend([0x9E, 0x00, 0x9E, 0x01, 0x9E, 0x00]);
        let marker = bytes.len();
        bytes.push(MARK_IDATA);
        let first = marker + 1 + 2 * IDATA_ENTRY_LEN;
        let second = first + 4;
        bytes.extend([0x00, SIG_INT]);
        bytes.extend((first as u32).to_be_bytes());
        bytes.extend([0x01, SIG_INT]);
        bytes.extend((second as u32).to_be_bytes());
        bytes.extend([0x9E, b'a', b'b', 0x00]);
        bytes.extend([0x9E, b'c', 0x00]);
        bytes.push(MARK_END);

        let p = Program::load(bytes, "t.mc").unwrap();
        assert_eq!(p.idata_offset(), Some(marker));
        assert_eq!(&*p.idata(0).unwrap(), b"ab");
        assert_eq!(&*p.idata(1).unwrap(), b"c");
        assert!(p.idata(2).is_err());
    }

    #[test]
    fn empty_idata_table() {
        let mut bytes = header(b'c', 0x0E, FLAG_IDATA);
        bytes.extend([MARK_IDATA, MARK_END]);
        let p = Program::load(bytes, "t.mc").unwrap();
        assert_eq!(p.idata_len(), 0);
    }

    #[test]
    fn stray_fd_in_code_is_skipped() {
        let mut bytes = header(b'c', 0x0E, FLAG_IDATA);
        // an int literal whose payload contains 0xFD
        bytes.extend([0x9B, 0x00, 0x00, 0x00, 0xFD]);
        let marker = bytes.len();
        bytes.extend([MARK_IDATA, MARK_END]);
        let p = Program::load(bytes, "t.mc").unwrap();
        assert_eq!(p.idata_offset(), Some(marker));
    }
}
