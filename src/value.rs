// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The tagged value tuple (CVT) and the versioned entry that pairs a key
//! and a CVT with the version it was written at (spec §3).
//!
//! Grounded on the teacher crate's `ValueType`/`InternalValue` tagging
//! approach (`src/value.rs`), generalized from a binary live/tombstone
//! tag to the full six-way tag the specification names.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{DecodeError, EncodeError};
use crate::extent::ExtentId;
use crate::key::{decode_key, encode_key, Key};
use crate::version::Version;

/// Tag discriminants, written as the first byte of an encoded [`Cvt`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
enum Tag {
    Inline = 0,
    Medium = 1,
    Large = 2,
    Tombstone = 3,
    LeafPointer = 4,
    Node = 5,
}

impl Tag {
    fn from_u8(b: u8) -> Result<Self, DecodeError> {
        match b {
            0 => Ok(Self::Inline),
            1 => Ok(Self::Medium),
            2 => Ok(Self::Large),
            3 => Ok(Self::Tombstone),
            4 => Ok(Self::LeafPointer),
            5 => Ok(Self::Node),
            other => Err(DecodeError::InvalidTag("Cvt", other)),
        }
    }
}

/// An offset into a component tree's data extent, used by the `Medium`
/// variant.
pub type DataOffset = u64;

/// The tagged value tuple: what a leaf entry's value slot actually holds
/// (spec §3). Every CVT variant also carries the length of the value it
/// describes, except `Tombstone` which has none.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Cvt {
    /// The value is stored inline, alongside the key, in the B-tree node
    /// itself.
    Inline(Box<[u8]>),

    /// The value lives in the owning CT's data extent at `offset`, is
    /// `len` bytes long.
    Medium { offset: DataOffset, len: u64 },

    /// The value lives in a dedicated large-object extent, `len` bytes
    /// long. The large-object list entry for `ext_id` tracks liveness
    /// (spec §3 "large-object list").
    Large { ext_id: ExtentId, len: u64 },

    /// The key was deleted at this version. Carries no payload but still
    /// occupies a CVT slot so version-ordered iteration sees it.
    Tombstone,

    /// An internal node's entry: a pointer to a non-leaf B-tree node
    /// identified by `ext_id`/offset within that node's tree extent.
    LeafPointer { ext_id: ExtentId, node_offset: u64 },

    /// An internal tree node, distinguished from `LeafPointer` when a
    /// node's entries themselves describe child node layout inline
    /// rather than by pointer (spec §6 node format).
    Node { ext_id: ExtentId, node_offset: u64 },
}

impl Cvt {
    /// The number of bytes this CVT's payload occupies, used for size
    /// accounting during merge (spec §4.4 extent sizing).
    #[must_use]
    pub fn value_len(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Medium { len, .. } | Self::Large { len, .. } => *len,
            Self::Tombstone => 0,
            Self::LeafPointer { .. } | Self::Node { .. } => 0,
        }
    }

    /// Whether this CVT represents a deletion.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

/// A single versioned entry as it appears in a leaf: key, the version it
/// was written at, and its CVT.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionedEntry {
    pub key: Key,
    pub version: Version,
    pub cvt: Cvt,
}

impl VersionedEntry {
    #[must_use]
    pub fn new(key: Key, version: Version, cvt: Cvt) -> Self {
        Self { key, version, cvt }
    }
}

pub(crate) fn encode_cvt<W: Write>(cvt: &Cvt, writer: &mut W) -> Result<(), EncodeError> {
    match cvt {
        Cvt::Inline(bytes) => {
            writer.write_u8(Tag::Inline as u8)?;
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32::<BigEndian>(bytes.len() as u32)?;
            writer.write_all(bytes)?;
        }
        Cvt::Medium { offset, len } => {
            writer.write_u8(Tag::Medium as u8)?;
            writer.write_u64::<BigEndian>(*offset)?;
            writer.write_u64::<BigEndian>(*len)?;
        }
        Cvt::Large { ext_id, len } => {
            writer.write_u8(Tag::Large as u8)?;
            writer.write_u64::<BigEndian>(ext_id.0)?;
            writer.write_u64::<BigEndian>(*len)?;
        }
        Cvt::Tombstone => {
            writer.write_u8(Tag::Tombstone as u8)?;
        }
        Cvt::LeafPointer { ext_id, node_offset } => {
            writer.write_u8(Tag::LeafPointer as u8)?;
            writer.write_u64::<BigEndian>(ext_id.0)?;
            writer.write_u64::<BigEndian>(*node_offset)?;
        }
        Cvt::Node { ext_id, node_offset } => {
            writer.write_u8(Tag::Node as u8)?;
            writer.write_u64::<BigEndian>(ext_id.0)?;
            writer.write_u64::<BigEndian>(*node_offset)?;
        }
    }
    Ok(())
}

pub(crate) fn decode_cvt<R: Read>(reader: &mut R) -> Result<Cvt, DecodeError> {
    let tag = Tag::from_u8(reader.read_u8()?)?;
    Ok(match tag {
        Tag::Inline => {
            let len = reader.read_u32::<BigEndian>()?;
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            Cvt::Inline(buf.into_boxed_slice())
        }
        Tag::Medium => {
            let offset = reader.read_u64::<BigEndian>()?;
            let len = reader.read_u64::<BigEndian>()?;
            Cvt::Medium { offset, len }
        }
        Tag::Large => {
            let ext_id = ExtentId(reader.read_u64::<BigEndian>()?);
            let len = reader.read_u64::<BigEndian>()?;
            Cvt::Large { ext_id, len }
        }
        Tag::Tombstone => Cvt::Tombstone,
        Tag::LeafPointer => {
            let ext_id = ExtentId(reader.read_u64::<BigEndian>()?);
            let node_offset = reader.read_u64::<BigEndian>()?;
            Cvt::LeafPointer { ext_id, node_offset }
        }
        Tag::Node => {
            let ext_id = ExtentId(reader.read_u64::<BigEndian>()?);
            let node_offset = reader.read_u64::<BigEndian>()?;
            Cvt::Node { ext_id, node_offset }
        }
    })
}

pub(crate) fn encode_entry<W: Write>(entry: &VersionedEntry, writer: &mut W) -> Result<(), EncodeError> {
    encode_key(&entry.key, writer)?;
    writer.write_u32::<BigEndian>(entry.version)?;
    encode_cvt(&entry.cvt, writer)
}

pub(crate) fn decode_entry<R: Read>(reader: &mut R) -> Result<VersionedEntry, DecodeError> {
    let key = decode_key(reader)?;
    let version = reader.read_u32::<BigEndian>()?;
    let cvt = decode_cvt(reader)?;
    Ok(VersionedEntry::new(key, version, cvt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cvt: Cvt) {
        let mut buf = Vec::new();
        encode_cvt(&cvt, &mut buf).unwrap();
        let decoded = decode_cvt(&mut &buf[..]).unwrap();
        assert_eq!(cvt, decoded);
    }

    #[test]
    fn roundtrips_every_variant() {
        roundtrip(Cvt::Inline(Box::from(*b"abc")));
        roundtrip(Cvt::Medium { offset: 42, len: 10 });
        roundtrip(Cvt::Large { ext_id: ExtentId(7), len: 4_096 });
        roundtrip(Cvt::Tombstone);
        roundtrip(Cvt::LeafPointer { ext_id: ExtentId(1), node_offset: 256 });
        roundtrip(Cvt::Node { ext_id: ExtentId(2), node_offset: 512 });
    }

    #[test]
    fn tombstone_has_no_length() {
        assert_eq!(Cvt::Tombstone.value_len(), 0);
        assert!(Cvt::Tombstone.is_tombstone());
        assert!(!Cvt::Inline(Box::from(*b"x")).is_tombstone());
    }

    #[test]
    fn invalid_tag_is_rejected() {
        let buf = [0xFFu8];
        let err = decode_cvt(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTag("Cvt", 0xFF)));
    }

    #[test]
    fn entry_roundtrip() {
        let entry = VersionedEntry::new(Key::new(*b"k"), 3, Cvt::Tombstone);
        let mut buf = Vec::new();
        encode_entry(&entry, &mut buf).unwrap();
        let decoded = decode_entry(&mut &buf[..]).unwrap();
        assert_eq!(entry, decoded);
    }
}
