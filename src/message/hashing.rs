//! Key to partition routing.
//!
//! Producers and nodes must agree on the partition of a key without talking to
//! each other, so the routing function is fixed bit for bit:
//!
//! 1. `digest = MD5(key)`
//! 2. decode `digest` as a zig-zag signed varint (little-endian base 128, the
//!    same rule as protobuf `sint64`); a varint that overflows 64 bits decodes
//!    to 0
//! 3. keep the low 31 bits
//! 4. take the result modulo the partition count

use integer_encoding::VarInt;
use md5::{Digest, Md5};

use crate::{AppError, AppResult};

const POSITIVE_MASK: i64 = 0x7FFF_FFFF;
const MAX_VARINT_LEN: usize = 10;

/// Maps a message key to a partition index in `[0, partitions)`.
pub fn hash_to_partition(key: &[u8], partitions: i32) -> AppResult<i32> {
    if key.is_empty() {
        return Err(AppError::EmptyKey);
    }
    if partitions <= 0 {
        return Err(AppError::InvalidValue(format!(
            "partition count {} must be positive",
            partitions
        )));
    }
    let hash = hash_code(key) & POSITIVE_MASK;
    Ok((hash % partitions as i64) as i32)
}

fn hash_code(key: &[u8]) -> i64 {
    let digest = Md5::digest(key);
    let unsigned = match u64::decode_var(digest.as_slice()) {
        // the tenth byte may only carry the single remaining bit
        Some((_, read)) if read == MAX_VARINT_LEN && digest[MAX_VARINT_LEN - 1] > 1 => 0,
        Some((value, _)) => value,
        None => 0,
    };
    zigzag_decode(unsigned)
}

fn zigzag_decode(value: u64) -> i64 {
    let shifted = (value >> 1) as i64;
    if value & 1 != 0 {
        !shifted
    } else {
        shifted
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(b"k0", 4, 0)]
    #[case(b"k1", 4, 3)]
    #[case(b"k1", 10, 7)]
    #[case(b"key-0", 4, 2)]
    #[case(b"key-0", 10, 0)]
    #[case(b"key-1", 4, 3)]
    #[case(b"hello", 4, 1)]
    #[case(b"a", 10, 6)]
    #[case(b"user-42", 10, 9)]
    #[case(b"k99", 4, 0)]
    fn test_reference_vectors(#[case] key: &[u8], #[case] partitions: i32, #[case] expected: i32) {
        assert_eq!(hash_to_partition(key, partitions).unwrap(), expected);
    }

    #[test]
    fn test_hash_is_deterministic_and_in_range() {
        for i in 0..500 {
            let key = format!("key-{}", i);
            for partitions in [1, 2, 3, 7, 16, 100] {
                let first = hash_to_partition(key.as_bytes(), partitions).unwrap();
                let second = hash_to_partition(key.as_bytes(), partitions).unwrap();
                assert_eq!(first, second);
                assert!((0..partitions).contains(&first));
            }
        }
    }

    #[test]
    fn test_empty_key_is_rejected() {
        assert!(matches!(
            hash_to_partition(b"", 4),
            Err(AppError::EmptyKey)
        ));
    }

    #[test]
    fn test_non_positive_partition_count_is_rejected() {
        assert!(matches!(
            hash_to_partition(b"key", 0),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_zigzag_decode() {
        assert_eq!(zigzag_decode(0), 0);
        assert_eq!(zigzag_decode(1), -1);
        assert_eq!(zigzag_decode(2), 1);
        assert_eq!(zigzag_decode(3), -2);
        assert_eq!(zigzag_decode(u64::MAX), i64::MIN);
    }
}
