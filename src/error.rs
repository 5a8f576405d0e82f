// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Error kinds for the doubling array, per the error handling design in
//! the specification: `NoSpace`, `Contention`, `ShuttingDown`, `NotFound`,
//! `Invalid`, `OutOfMemory` and `Internal`, plus the usual I/O/encoding
//! wrappers for the ambient checkpoint layer.

use std::io;

/// Errors that can occur while operating a doubling array.
#[derive(Debug)]
pub enum Error {
    /// An extent allocation or freespace preallocation failed. The owning
    /// DA is frozen as a side effect (see [`crate::da::DoublingArray::freeze`]).
    NoSpace,

    /// Lost a race for an exclusive bit (e.g. the growing bit on a DA).
    /// The caller should retry.
    Contention,

    /// `destroy` was called on a DA that still has outstanding
    /// attachments.
    Busy,

    /// The DA is exiting or has been marked deleted; the caller should
    /// stop whatever loop it was running.
    ShuttingDown,

    /// A lookup (hash table, CT, version) found nothing.
    NotFound,

    /// A caller-supplied argument or persisted record was invalid.
    Invalid(&'static str),

    /// A buffer or index allocation failed (iterator setup, modlist sort).
    OutOfMemory,

    /// An internal invariant was violated. Unrecoverable.
    Internal(&'static str),

    /// Underlying I/O error from the metadata store.
    Io(io::Error),

    /// Checkpoint record encoding failed.
    Encode(EncodeError),

    /// Checkpoint record decoding failed.
    Decode(DecodeError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSpace => write!(f, "no space left for extent allocation"),
            Self::Contention => write!(f, "lost a contended bit, retry"),
            Self::Busy => write!(f, "doubling array still has outstanding attachments"),
            Self::ShuttingDown => write!(f, "doubling array is shutting down"),
            Self::NotFound => write!(f, "not found"),
            Self::Invalid(msg) => write!(f, "invalid: {msg}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Internal(msg) => write!(f, "internal invariant violated: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Errors produced while serializing a checkpoint record.
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error while writing.
    Io(io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<io::Error> for EncodeError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Errors produced while deserializing a checkpoint record.
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error while reading.
    Io(io::Error),

    /// Header magic bytes did not match.
    InvalidHeader(&'static str),

    /// An enum tag byte did not map to a known variant.
    InvalidTag(&'static str, u8),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::InvalidHeader(what) => write!(f, "invalid header for {what}"),
            Self::InvalidTag(what, tag) => write!(f, "invalid tag {tag} for {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
