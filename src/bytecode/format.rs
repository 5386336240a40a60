//! Byte-level layout shared by the compiler and the VM.
//!
//! All multi-byte integers are big-endian. Every node may be preceded by a
//! file marker and fault sites end with a position marker.

// ── Header ──────────────────────────────────────────────────────────

pub const MAGIC: [u8; 2] = [0x0B, b'm'];
pub const MODE_EXECUTABLE: u8 = b'c';
pub const MODE_LIBRARY: u8 = b'l';
pub const CONFIRM_EXECUTABLE: u8 = 0x0E;
pub const CONFIRM_LIBRARY: u8 = 0x0F;
pub const HEADER_LEN: usize = 8;
pub const FLAG_IDATA: u8 = 0x01;

// ── Literal signatures ──────────────────────────────────────────────

pub const SIG_INT: u8 = 0x9B;
pub const SIG_STRING: u8 = 0x9E;
pub const SIG_IDENT: u8 = 0x9F;

// ── Markers ─────────────────────────────────────────────────────────

pub const MARK_END: u8 = 0x00;
pub const MARK_LIBRARY: u8 = 0xE0;
pub const MARK_IDATA: u8 = 0xFD;
pub const MARK_POS: u8 = 0xFE;
pub const MARK_FILE: u8 = 0xFF;

/// idata table entry: index byte, `SIG_INT`, 4-byte offset.
pub const IDATA_ENTRY_LEN: usize = 6;
pub const IDATA_CAPACITY: usize = 256;

// ── Declaration flags (var-new / var-un) ────────────────────────────

pub const DECL_HAS_INIT: u8 = 0x01;
pub const DECL_ARRAY: u8 = 0x02;
pub const DECL_POINTER: u8 = 0x04;

// ── Opcodes ─────────────────────────────────────────────────────────

/// One tag byte per node kind; decoded once per instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Int = 0x9B,
    Str = 0x9E,
    GetItem = 0x9A,
    UnOp = 0x9C,
    BinOp = 0x9D,
    Return = 0xC0,
    Extern = 0xC1,
    Struct = 0xC2,
    Typedef = 0xC3,
    Const = 0xC4,
    Unsigned = 0xC5,
    Else = 0xC6,
    VarNew = 0xD1,
    VarAssign = 0xD2,
    Inc = 0xD3,
    Dec = 0xD4,
    Call = 0xD5,
    VarAccess = 0xD6,
    VarUn = 0xD7,
    If = 0xD8,
    While = 0xD9,
    For = 0xDA,
    FuncDec = 0xDB,
    FuncDef = 0xDC,
    SetItem = 0xDD,
}

impl Opcode {
    pub fn decode(byte: u8) -> Option<Self> {
        use Opcode::*;
        Some(match byte {
            0x9B => Int,
            0x9E => Str,
            0x9A => GetItem,
            0x9C => UnOp,
            0x9D => BinOp,
            0xC0 => Return,
            0xC1 => Extern,
            0xC2 => Struct,
            0xC3 => Typedef,
            0xC4 => Const,
            0xC5 => Unsigned,
            0xC6 => Else,
            0xD1 => VarNew,
            0xD2 => VarAssign,
            0xD3 => Inc,
            0xD4 => Dec,
            0xD5 => Call,
            0xD6 => VarAccess,
            0xD7 => VarUn,
            0xD8 => If,
            0xD9 => While,
            0xDA => For,
            0xDB => FuncDec,
            0xDC => FuncDef,
            0xDD => SetItem,
            _ => return None,
        })
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_decodes_to_itself() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::decode(byte) {
                assert_eq!(op.byte(), byte);
            }
        }
    }

    #[test]
    fn markers_are_not_opcodes() {
        for marker in [MARK_END, MARK_LIBRARY, MARK_IDATA, MARK_POS, MARK_FILE, SIG_IDENT] {
            assert!(Opcode::decode(marker).is_none(), "{marker:#x}");
        }
    }
}
