//! Hexdump rendering for terminal output.

use std::fmt::Write;

const WIDTH: usize = 16;

/// Renders `memory` as a 16-byte-wide hexdump, addressing each line from
/// `base_address`.
pub fn hexdump(memory: &[u8], base_address: u32) -> String {
    let mut out = String::new();
    for (line_index, chunk) in memory.chunks(WIDTH).enumerate() {
        let mut hex = String::new();
        let mut ascii = String::new();
        for &byte in chunk {
            write!(hex, "{byte:02X} ").ok();
            if (0x20..=0x7F).contains(&byte) {
                ascii.push(byte as char);
            } else {
                ascii.push('.');
            }
        }
        let address = base_address.wrapping_add((line_index * WIDTH) as u32);
        writeln!(out, " {address:08X}: {hex:<48} {ascii}").ok();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump() {
        let dump = hexdump(b"ABCD\x00\x01", 0x1000);
        assert_eq!(
            dump,
            " 00001000: 41 42 43 44 00 01                                ABCD..\n"
        );
    }

    #[test]
    fn test_hexdump_two_lines() {
        let data: Vec<u8> = (0u8..18).collect();
        let dump = hexdump(&data, 0);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(" 00000000:"));
        assert!(lines[1].starts_with(" 00000010:"));
    }
}
