//! Key hashing algorithms.
//!
//! Every algorithm here is a pure function of the key, so that two clients
//! configured identically route every key identically.

use md5::{Digest, Md5};

/// Selects how keys are hashed onto the ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HashAlgorithm {
    /// The 31-polynomial string hash, over UTF-16 code units.
    #[default]
    Native,

    /// The `hash * 33 + c` hash used by older clients.
    OldCompat,

    /// The upper half of a CRC32, masked to 15 bits.
    NewCompat,

    /// MD5 hashing onto a consistent ring.
    Consistent,
}

impl HashAlgorithm {
    pub fn hash(&self, key: &str) -> i64 {
        match self {
            HashAlgorithm::Native => i64::from(native_hash(key)),
            HashAlgorithm::OldCompat => i64::from(old_compat_hash(key)),
            HashAlgorithm::NewCompat => i64::from(new_compat_hash(key)),
            HashAlgorithm::Consistent => i64::from(md5_hash(key)),
        }
    }

    pub fn is_consistent(&self) -> bool {
        matches!(self, HashAlgorithm::Consistent)
    }
}

pub fn native_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

pub fn old_compat_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(33).wrapping_add(i32::from(c)))
}

pub fn new_compat_hash(key: &str) -> i32 {
    let crc = crc32fast::hash(key.as_bytes());
    ((crc >> 16) & 0x7fff) as i32
}

pub fn md5_hash(key: &str) -> u32 {
    let digest = Md5::digest(key.as_bytes());
    md5_point(&digest, 0)
}

// Reads the `h`th little-endian u32 out of an MD5 digest.
pub(crate) fn md5_point(digest: &[u8], h: usize) -> u32 {
    let b = &digest[h * 4..h * 4 + 4];
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn native_hash_matches_known_values() {
        assert_eq!(native_hash(""), 0);
        assert_eq!(native_hash("a"), 97);
        assert_eq!(native_hash("hello"), 99162322);
        // Overflow wraps rather than saturating.
        assert_eq!(native_hash("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn old_compat_hash_matches_known_values() {
        assert_eq!(old_compat_hash("ab"), 97 * 33 + 98);
        assert_eq!(old_compat_hash("abc"), (97 * 33 + 98) * 33 + 99);
    }

    #[test]
    fn new_compat_hash_uses_upper_crc_bits() {
        // crc32("123456789") == 0xCBF43926
        assert_eq!(new_compat_hash("123456789"), 0x4BF4);
        assert!((0..=0x7fff).contains(&new_compat_hash("some-key")));
    }

    #[test]
    fn md5_hash_reads_little_endian() {
        // md5("") == d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(md5_hash(""), 0xd98c1dd4);
        let digest = Md5::digest(b"");
        assert_eq!(md5_point(&digest, 1), 0x04b2008f);
    }

    #[test]
    fn hashes_are_deterministic() {
        for algorithm in [
            HashAlgorithm::Native,
            HashAlgorithm::OldCompat,
            HashAlgorithm::NewCompat,
            HashAlgorithm::Consistent,
        ] {
            assert_eq!(algorithm.hash("user:1234"), algorithm.hash("user:1234"));
        }
    }
}
