use std::fmt::Write;

/// Classic 16-bytes-per-row dump with an offset column and an ASCII gutter.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' }));
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_short_row() {
        let dump = hexdump(&[0x0B, b'm', b'c', 0x0E]);
        assert!(dump.starts_with("00000000  0b 6d 63 0e "));
        assert!(dump.ends_with("|.mc.|\n"));
    }

    #[test]
    fn rows_of_sixteen() {
        let dump = hexdump(&[0u8; 20]);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("00000010  "));
    }
}
