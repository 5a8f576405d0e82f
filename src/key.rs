// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Opaque, variable-length, multi-dimensional keys (spec §3).
//!
//! Ordering of two keys is delegated to a `KeyComparator` rather than
//! `Ord`, because the B-tree vtable owns `key_compare` (spec §6) — the
//! comparator is how callers outside the vtable (iterators, the merge
//! pipeline) stay agnostic to the dimension-wise comparison a particular
//! tree type uses.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::{DecodeError, EncodeError};

/// An opaque key. Cheaply cloneable (an `Arc<[u8]>` under the hood, same
/// rationale as the teacher crate's `Slice` type).
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Key(Arc<[u8]>);

impl Key {
    /// Wraps raw bytes as a key.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into().into_boxed_slice()))
    }

    /// Borrows the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

/// A key that is either a real, comparable key or the distinguished
/// maximum. Used wherever the spec calls for `MAX_KEY` to participate in
/// comparisons (e.g. maxification of separator keys, spec §4.4 step 9).
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum BoundKey {
    /// A real key, compared via [`KeyComparator::compare`].
    Real(Key),
    /// The strict maximum; greater than every real key.
    Max,
}

impl BoundKey {
    /// Wraps a real key.
    #[must_use]
    pub fn real(key: Key) -> Self {
        Self::Real(key)
    }
}

/// Per-tree-type key comparator: the `key_compare`/`max_key` slice of the
/// B-tree vtable (spec §6).
///
/// Implementations perform the lexicographic, dimension-wise compare the
/// spec describes; the default implementation treats keys as flat byte
/// strings, which is sufficient for every multi-dimensional key that has
/// already been flattened into a single comparable byte string by the
/// caller (the usual arrangement, and the one the object-key conversion
/// layer in `castle_objects.h` performs upstream of the B-tree).
pub trait KeyComparator: Send + Sync {
    /// Compares two real keys.
    fn compare(&self, a: &Key, b: &Key) -> std::cmp::Ordering;

    /// Compares a (possibly bound) key against a real key.
    fn compare_bound(&self, a: &BoundKey, b: &Key) -> std::cmp::Ordering {
        match a {
            BoundKey::Max => std::cmp::Ordering::Greater,
            BoundKey::Real(k) => self.compare(k, b),
        }
    }
}

/// Flat lexicographic byte-string comparator. The default for trees whose
/// keys are already flattened.
#[derive(Clone, Copy, Default)]
pub struct LexicographicComparator;

impl KeyComparator for LexicographicComparator {
    fn compare(&self, a: &Key, b: &Key) -> std::cmp::Ordering {
        a.as_bytes().cmp(b.as_bytes())
    }
}

pub(crate) fn encode_key<W: Write>(key: &Key, writer: &mut W) -> Result<(), EncodeError> {
    let bytes = key.as_bytes();
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32::<BigEndian>(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

pub(crate) fn decode_key<R: Read>(reader: &mut R) -> Result<Key, DecodeError> {
    let len = reader.read_u32::<BigEndian>()?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(Key::new(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_order() {
        let cmp = LexicographicComparator;
        let a = Key::new(*b"a");
        let b = Key::new(*b"b");
        assert_eq!(cmp.compare(&a, &b), std::cmp::Ordering::Less);
        assert_eq!(cmp.compare(&a, &a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn bound_max_greater_than_any_real_key() {
        let cmp = LexicographicComparator;
        let huge = Key::new(vec![0xFF; 64]);
        assert_eq!(
            cmp.compare_bound(&BoundKey::Max, &huge),
            std::cmp::Ordering::Greater
        );
    }

    #[test]
    fn roundtrip_encode_decode() {
        let key = Key::new(*b"hello-key");
        let mut buf = Vec::new();
        encode_key(&key, &mut buf).unwrap();
        let decoded = decode_key(&mut &buf[..]).unwrap();
        assert_eq!(key, decoded);
    }
}
