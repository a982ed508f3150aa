//! A `hexdump -C`-style dump, used by the CLI to show raw block contents.

use std::fmt::Write as _;

/// Formats `data` as 16-bytes-per-line hex + ASCII, the layout printed by
/// the original tool's `DumpHex` debug helper.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", i * 16);
        for (j, b) in chunk.iter().enumerate() {
            let _ = write!(out, "{b:02x} ");
            if j == 7 {
                out.push(' ');
            }
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str(" |");
        for &b in chunk {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' };
            out.push(c);
        }
        out.push_str("|\n");
    }
    out
}
