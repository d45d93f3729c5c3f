//! Byte-level trace formatting for forwarded payloads.

use std::fmt::Write as _;

use tracing::debug;

use crate::config::DumpMode;

const ROW_BYTES: usize = 16;

/// Format a payload as canonical hexdump rows.
///
/// Each row carries an 8-hex-digit zero-padded offset, four spaces, 16
/// lowercase space-separated byte pairs (the partial last row padded with
/// 3-space slots), and the ASCII column with non-graphic bytes as `.`.
pub fn hex_rows(data: &[u8]) -> Vec<String> {
    let mut rows = Vec::with_capacity(data.len().div_ceil(ROW_BYTES));

    for (row, chunk) in data.chunks(ROW_BYTES).enumerate() {
        let mut hex = String::with_capacity(ROW_BYTES * 3);
        let mut ascii = String::with_capacity(ROW_BYTES);

        for byte in chunk {
            let _ = write!(hex, "{byte:02x} ");
            ascii.push(if byte.is_ascii_graphic() {
                *byte as char
            } else {
                '.'
            });
        }
        for _ in chunk.len()..ROW_BYTES {
            hex.push_str("   ");
        }

        rows.push(format!("{:08x}    {}   {}", row * ROW_BYTES, hex, ascii));
    }

    rows
}

/// Render a payload as text, up to the first NUL byte.
pub fn ascii_text(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Emit the trace records for one transfer in the given mode.
pub fn emit(mode: DumpMode, data: &[u8]) {
    match mode {
        DumpMode::Hex => {
            for row in hex_rows(data) {
                debug!("{row}");
            }
        }
        DumpMode::Ascii => debug!("message=[{}]", ascii_text(data)),
        DumpMode::None => {}
    }
}
