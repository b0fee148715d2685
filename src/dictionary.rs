// ABOUTME: The fixed 14-entry property-name/value dictionary used to abbreviate common strings
// ABOUTME: Indexed 1..=14; a lookup byte in that range followed by NUL stands in for the full string

/// The well-known strings eligible for single-byte dictionary encoding, in
/// wire order. Index `i` (1-based) is written as the byte `i` followed by a
/// NUL terminator.
pub const ENTRIES: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// Dictionary indices are encoded in `[0x01, 0x0E]`; anything else begins a
/// raw string.
const MAX_INDEX: u8 = ENTRIES.len() as u8;

/// Return the 1-based dictionary index for `s`, if it is a dictionary entry.
pub fn index_of(s: &str) -> Option<u8> {
    ENTRIES
        .iter()
        .position(|entry| *entry == s)
        .map(|pos| (pos + 1) as u8)
}

/// Resolve a 1-based dictionary index to its string, if valid.
pub fn lookup(index: u8) -> Option<&'static str> {
    if index == 0 || index > MAX_INDEX {
        return None;
    }
    Some(ENTRIES[(index - 1) as usize])
}

/// Whether `byte` is a valid leading byte for a dictionary-index encoding.
pub fn is_index_byte(byte: u8) -> bool {
    (1..=MAX_INDEX).contains(&byte)
}
