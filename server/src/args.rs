//! Value parsers shared by the server binaries

use shared::{Key, KEY_BYTES};

/// Parses a protocol id given as `0x`-prefixed hex or decimal
pub fn parse_protocol_id(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid protocol id {:?}: {}", value, e))
}

/// Parses a hex-encoded private key
pub fn parse_key(value: &str) -> Result<Key, String> {
    let bytes = hex::decode(value).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|_| format!("private key must be {} bytes", KEY_BYTES))
}
