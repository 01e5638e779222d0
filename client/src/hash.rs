// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Filename-to-shard hashing. The first stage is a 13-bit partition id over
//! the final path component; the second stage mixes it with the metadata
//! servers' 32-bit integer hash so both sides agree on shard placement.

const FILENAME_LENGTH: usize = 255;
const PART_ID_MASK: u16 = 0x1FFF;

/// 13-bit partition id of a file name. The upper bits of the running hash
/// are discarded by design; the partition space is 8192 wide.
pub fn hash_part_id(file_name: &str) -> u16 {
    let mut hash: u16 = 0;
    for byte in file_name.bytes().take(FILENAME_LENGTH) {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u16);
    }
    hash & PART_ID_MASK
}

#[inline]
fn rotate_left32(word: u32, n: u32) -> u32 {
    word.rotate_left(n)
}

fn hash_bytes_uint32(k: u32) -> u32 {
    let mut a: u32 = 0x9e3779b9u32
        .wrapping_add(std::mem::size_of::<u32>() as u32)
        .wrapping_add(3923095);
    let mut b = a;
    let mut c = a;
    a = a.wrapping_add(k);

    c ^= b;
    c = c.wrapping_sub(rotate_left32(b, 14));
    a ^= c;
    a = a.wrapping_sub(rotate_left32(c, 11));
    b ^= a;
    b = b.wrapping_sub(rotate_left32(a, 25));
    c ^= b;
    c = c.wrapping_sub(rotate_left32(b, 16));
    a ^= c;
    a = a.wrapping_sub(rotate_left32(c, 4));
    b ^= a;
    b = b.wrapping_sub(rotate_left32(a, 14));
    c ^= b;
    c = c.wrapping_sub(rotate_left32(b, 24));

    c
}

/// 32-bit integer hash over a partition id, sign-folded and with the top
/// bit cleared so it lands in the positive `i32` key space.
pub fn hash_int32(val: i64) -> i32 {
    let mut lohalf = val as u32;
    let hihalf = (val >> 32) as u32;
    lohalf ^= if val >= 0 { hihalf } else { !hihalf };
    let res = hash_bytes_uint32(lohalf);
    (res & !(1u32 << 31)) as i32
}

/// The shard-lookup key for a file path's final component.
pub fn shard_key(file_name: &str) -> i32 {
    hash_int32(hash_part_id(file_name) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_id_is_13_bits() {
        for name in ["a", "some-long-file-name.bin", "目录", ""] {
            assert!(hash_part_id(name) <= PART_ID_MASK);
        }
        assert_eq!(hash_part_id("a"), 97);
        assert_eq!(hash_part_id(""), 0);
    }

    #[test]
    fn test_part_id_is_stable() {
        assert_eq!(hash_part_id("model.bin"), hash_part_id("model.bin"));
        assert_ne!(hash_part_id("model.bin"), hash_part_id("model.bim"));
    }

    #[test]
    fn test_hash_int32_is_non_negative() {
        for v in [-1i64, 0, 1, 42, i64::MAX, i64::MIN, 8191] {
            assert!(hash_int32(v) >= 0);
        }
    }

    #[test]
    fn test_hash_int32_spreads() {
        let mut seen = std::collections::HashSet::new();
        for v in 0..1000i64 {
            seen.insert(hash_int32(v));
        }
        assert!(seen.len() > 990);
    }
}
