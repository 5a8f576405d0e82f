// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bloom filter construction and query (spec §3 "optional Bloom filter",
//! §6 external collaborator).
//!
//! Ported from the teacher crate's `src/bloom/mod.rs` + `bit_array.rs`
//! nearly directly (double hashing, `with_fp_rate` sizing), generalized
//! to operate on raw key bytes rather than segment-specific hash
//! caching.

mod bit_array;

use bit_array::BitArray;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::coding::{Decode, Encode};
use crate::error::{DecodeError, EncodeError};

const MAGIC_BYTES: [u8; 4] = *b"DAbf";

/// Two hashes used for double hashing.
pub type CompositeHash = (u64, u64);

/// A standard Bloom filter.
///
/// Allows buffering key hashes before actual filter construction, which
/// is needed to size the filter correctly when the item count is
/// unknown until a merge finishes writing (spec §4.4 step 10).
///
/// Uses double hashing instead of `k` independent hash functions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BloomFilter {
    inner: BitArray,
    /// Bit count.
    m: usize,
    /// Number of hash rounds.
    k: usize,
}

impl Encode for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u8(0)?; // filter type
        writer.write_u8(0)?; // hash type (unused)
        writer.write_u64::<BigEndian>(self.m as u64)?;
        writer.write_u64::<BigEndian>(self.k as u64)?;
        writer.write_all(self.inner.bytes())?;
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("BloomFilter"));
        }

        let filter_type = reader.read_u8()?;
        if filter_type != 0 {
            return Err(DecodeError::InvalidTag("BloomFilter::filter_type", filter_type));
        }
        let hash_type = reader.read_u8()?;
        if hash_type != 0 {
            return Err(DecodeError::InvalidTag("BloomFilter::hash_type", hash_type));
        }

        let m = reader.read_u64::<BigEndian>()? as usize;
        let k = reader.read_u64::<BigEndian>()? as usize;

        let mut bytes = vec![0; m / 8];
        reader.read_exact(&mut bytes)?;

        Ok(Self::from_raw(m, k, bytes.into_boxed_slice()))
    }
}

#[allow(clippy::len_without_is_empty)]
impl BloomFilter {
    /// Size of the filter in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.bytes().len()
    }

    /// Number of hashes used per lookup.
    #[must_use]
    pub fn hash_fn_count(&self) -> usize {
        self.k
    }

    fn from_raw(m: usize, k: usize, bytes: Box<[u8]>) -> Self {
        Self {
            inner: BitArray::from_bytes(bytes),
            m,
            k,
        }
    }

    /// Constructs a filter sized to hold `n` items at false-positive
    /// rate `fpr`.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    #[must_use]
    pub fn with_fp_rate(n: usize, fpr: f32) -> Self {
        use std::f32::consts::LN_2;

        assert!(n > 0);

        let fpr = fpr.max(0.000_001);

        let m = Self::calculate_m(n, fpr);
        let bpk = m / n;
        let k = (((bpk as f32) * LN_2) as usize).max(1);

        Self {
            inner: BitArray::with_capacity(m / 8),
            m,
            k,
        }
    }

    /// Constructs a filter sized to hold `n` items with `bpk` bits per
    /// key. 10 bits per key is a sensible default
    /// ([`crate::config::Config::bloom_bits_per_key`]'s default).
    ///
    /// # Panics
    ///
    /// Panics if `n == 0` or `bpk == 0`.
    #[must_use]
    pub fn with_bpk(n: usize, bpk: u8) -> Self {
        use std::f32::consts::LN_2;

        assert!(bpk > 0);
        assert!(n > 0);

        let bpk = bpk as usize;
        let m = n * bpk;
        let k = (((bpk as f32) * LN_2) as usize).max(1);

        let bytes = (m as f32 / 8.0).ceil() as usize;

        Self {
            inner: BitArray::with_capacity(bytes),
            m: bytes * 8,
            k,
        }
    }

    fn calculate_m(n: usize, fp_rate: f32) -> usize {
        use std::f32::consts::LN_2;

        let n = n as f32;
        let ln2_squared = LN_2.powi(2);

        let numerator = n * fp_rate.ln();
        let m = -(numerator / ln2_squared);

        ((m / 8.0).ceil() * 8.0) as usize
    }

    /// Returns `true` if the hash may be contained. Never a false
    /// negative.
    #[must_use]
    pub fn contains_hash(&self, (mut h1, mut h2): CompositeHash) -> bool {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);

            if !self.has_bit(idx as usize) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }

        true
    }

    /// Returns `true` if the key may be contained. Never a false
    /// negative.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(Self::get_hash(key))
    }

    /// Adds a key to the filter.
    pub fn set_with_hash(&mut self, (mut h1, mut h2): CompositeHash) {
        for i in 0..(self.k as u64) {
            let idx = h1 % (self.m as u64);
            self.enable_bit(idx as usize);
            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }
    }

    fn has_bit(&self, idx: usize) -> bool {
        self.inner.get(idx)
    }

    fn enable_bit(&mut self, idx: usize) {
        self.inner.set(idx, true);
    }

    /// Computes the composite hash of a key.
    #[must_use]
    pub fn get_hash(key: &[u8]) -> CompositeHash {
        let h0 = xxhash_rust::xxh3::xxh3_128(key);
        let h1 = (h0 >> 64) as u64;
        let h2 = h0 as u64;
        (h1, h2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bloom_serde_round_trip() {
        let mut filter = BloomFilter::with_fp_rate(10, 0.0001);

        let keys: &[&[u8]] = &[
            b"item0", b"item1", b"item2", b"item3", b"item4", b"item5", b"item6", b"item7",
            b"item8", b"item9",
        ];

        for key in keys {
            filter.set_with_hash(BloomFilter::get_hash(key));
        }
        for key in keys {
            assert!(filter.contains(key));
        }
        assert!(!filter.contains(b"asdasads"));

        let mut buf = Vec::new();
        filter.encode_into(&mut buf).unwrap();
        let filter_copy = BloomFilter::decode_from(&mut &buf[..]).unwrap();
        assert_eq!(filter, filter_copy);

        for key in keys {
            assert!(filter_copy.contains(key));
        }
        assert!(!filter_copy.contains(b"asdasads"));
    }

    #[test]
    fn bloom_calculate_m() {
        assert_eq!(9_592, BloomFilter::calculate_m(1_000, 0.01));
        assert_eq!(4_800, BloomFilter::calculate_m(1_000, 0.1));
    }

    #[test]
    fn bloom_basic() {
        let mut filter = BloomFilter::with_fp_rate(10, 0.0001);

        for key in [
            b"item0", b"item1", b"item2", b"item3", b"item4", b"item5", b"item6", b"item7",
            b"item8", b"item9",
        ] {
            assert!(!filter.contains(key));
            filter.set_with_hash(BloomFilter::get_hash(key));
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn bloom_bpk_low_fpr_under_bound() {
        let item_count = 1_000;
        let bpk = 10;

        let mut filter = BloomFilter::with_bpk(item_count, bpk);

        for key in (0..item_count).map(|_| nanoid::nanoid!()) {
            filter.set_with_hash(BloomFilter::get_hash(key.as_bytes()));
            assert!(filter.contains(key.as_bytes()));
        }

        let mut false_positives = 0;
        for key in (0..item_count).map(|_| nanoid::nanoid!()) {
            if filter.contains(key.as_bytes()) {
                false_positives += 1;
            }
        }

        let fpr = false_positives as f32 / item_count as f32;
        assert!(fpr < 0.05);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = vec![0u8, 0, 0, 0];
        buf.extend_from_slice(&[0, 0]);
        let err = BloomFilter::decode_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidHeader("BloomFilter")));
    }
}
