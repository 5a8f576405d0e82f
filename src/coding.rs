// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `Encode`/`Decode` traits shared by on-disk record types (checkpoint
//! records, the Bloom filter). Grounded directly on the teacher crate's
//! `src/coding.rs`.

use std::io::{Read, Write};

use crate::error::{DecodeError, EncodeError};

/// Trait to serialize stuff.
pub trait Encode {
    /// Serializes into a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying writer fails.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into a fresh vector.
    #[must_use]
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        #[expect(clippy::expect_used, reason = "writing to a Vec cannot fail")]
        self.encode_into(&mut v).expect("cannot fail");
        v
    }
}

/// Trait to deserialize stuff.
pub trait Decode {
    /// Deserializes from a reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader fails or the bytes are malformed.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}
