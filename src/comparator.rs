use std::cmp::Ordering;

use crate::constants::DbFlags;

/// Key comparison capability. Any function that orders byte strings
/// consistently can be installed per database.
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

/// Byte-wise lexicographic order; shorter keys sort first on a common prefix.
pub fn cmp_lexical(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Lexicographic order of the reversed byte strings.
pub fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// Native integer order for 4- or 8-byte little-endian keys. Other lengths
/// fall back to lexicographic order.
pub fn cmp_integer(a: &[u8], b: &[u8]) -> Ordering {
    match (a.len(), b.len()) {
        (4, 4) => le_u32(a).cmp(&le_u32(b)),
        (8, 8) => le_u64(a).cmp(&le_u64(b)),
        _ => a.len().cmp(&b.len()).then_with(|| cmp_lexical(a, b)),
    }
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    u64::from_le_bytes(buf)
}

/// Comparator implied by a database's key flags.
pub(crate) fn default_key_cmp(flags: DbFlags) -> Comparator {
    if flags.contains(DbFlags::INTEGERKEY) {
        cmp_integer
    } else if flags.contains(DbFlags::REVERSEKEY) {
        cmp_reverse
    } else {
        cmp_lexical
    }
}

/// Comparator implied by a database's duplicate flags.
pub(crate) fn default_dup_cmp(flags: DbFlags) -> Comparator {
    if flags.contains(DbFlags::INTEGERDUP) {
        cmp_integer
    } else if flags.contains(DbFlags::REVERSEDUP) {
        cmp_reverse
    } else {
        cmp_lexical
    }
}
