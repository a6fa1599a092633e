//! FNV-1a 32-bit hash, used to turn a log format string into a
//! `token_hash` and to fold a token database's hash set into a single
//! `BUILD_ID`. Must match the embedded side bit-exactly.

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The canonical `BUILD_ID` definition: FNV-1a over the sorted set of
/// token hashes, each folded in as little-endian bytes in ascending
/// order. This choice (rather than, say, big-endian or string
/// concatenation of hex digits) is arbitrary but fixed; it must agree
/// with whatever the firmware-side token generator computes.
pub fn build_id_of(hashes: impl IntoIterator<Item = u32>) -> u32 {
    let mut sorted: Vec<u32> = hashes.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut buf = Vec::with_capacity(sorted.len() * 4);
    for hash in sorted {
        buf.extend_from_slice(&hash.to_le_bytes());
    }
    fnv1a_32(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_hashes_to_offset_basis() {
        assert_eq!(fnv1a_32(b""), FNV_OFFSET_BASIS);
    }

    #[test]
    fn known_vector() {
        // FNV-1a 32-bit of "a" is a well-known test vector.
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn build_id_is_order_independent() {
        let a = build_id_of([3, 1, 2]);
        let b = build_id_of([1, 2, 3]);
        assert_eq!(a, b);
    }

    #[test]
    fn build_id_ignores_duplicates() {
        let a = build_id_of([1, 2, 3]);
        let b = build_id_of([1, 2, 2, 3]);
        assert_eq!(a, b);
    }
}
