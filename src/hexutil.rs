//! Hex helpers for building APDUs from strings and logging raw traffic.

/// Whether `s` is a non-empty, even-length string of hex digits.
pub fn is_valid_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Decode a hex string into bytes. Total: any malformed input (odd length,
/// non-hex digit, empty) yields an empty vector rather than an error or panic.
pub fn hex_to_bytes(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap_or_default()
}

/// Lowercase hex, two digits per byte, no separator.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Uppercase hex, two digits per byte, no separator.
pub fn to_hex_upper(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Lowercase hex with a separator between bytes, e.g. `"e0:d8:00"`.
pub fn to_hex_separated(bytes: &[u8], separator: &str) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(separator)
}
