/// Layout of a hex dump line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexdumpConfig {
    pub bytes_per_line: usize,
    /// Bytes printed together before a separating space.
    pub group_bytes: usize,
    pub show_ascii: bool,
    pub show_offset: bool,
    /// Hex digits in the offset column, e.g. 4 or 8.
    pub offset_width: usize,
}

impl Default for HexdumpConfig {
    fn default() -> Self {
        HexdumpConfig {
            bytes_per_line: 16,
            group_bytes: 2,
            show_ascii: true,
            show_offset: true,
            offset_width: 4,
        }
    }
}

pub fn format_hexdump(data: &[u8]) -> String {
    format_hexdump_with_config(data, &HexdumpConfig::default())
}

pub fn format_hexdump_with_config(data: &[u8], config: &HexdumpConfig) -> String {
    let bytes_per_line = config.bytes_per_line.max(1);
    let group_bytes = config.group_bytes.max(1);
    // width of a full line's hex column, so short last lines still align
    let hex_width = bytes_per_line * 2 + bytes_per_line / group_bytes;

    let mut result = String::new();

    for (i, chunk) in data.chunks(bytes_per_line).enumerate() {
        if config.show_offset {
            result.push_str(&format!(
                "{:0width$x}: ",
                i * bytes_per_line,
                width = config.offset_width
            ));
        }

        let mut hex = String::with_capacity(hex_width);
        for (j, byte) in chunk.iter().enumerate() {
            hex.push_str(&format!("{:02x}", byte));
            if (j + 1) % group_bytes == 0 {
                hex.push(' ');
            }
        }
        result.push_str(&format!("{hex:<hex_width$}"));

        if config.show_ascii {
            result.push_str(" |");
            for &byte in chunk {
                if byte.is_ascii_graphic() || byte == b' ' {
                    result.push(byte as char);
                } else {
                    result.push('.');
                }
            }
            result.push('|');
        }

        result.push('\n');
    }

    result
}

/// Hex dump framed by a header naming the protocol and a closing line.
pub fn packet_dump(data: &[u8], protocol: &str) -> String {
    format!(
        "=== {} Packet Dump ({} bytes) ===\n{}=== End of Packet ===\n",
        protocol,
        data.len(),
        format_hexdump(data)
    )
}
