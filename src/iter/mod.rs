// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The pull-based iterator family (spec §4.1-4.3, §4.9) and the
//! duck-typed capability trait they share (Design Note: "duck-typed
//! iterator vtable").
//!
//! Grounded on the teacher crate's `src/merge.rs` (`Merger`'s
//! heap-of-cursors pull model) and `src/segment/reader.rs`-style
//! sequential leaf-chain walking, adapted to the specification's
//! explicit `{register_cb, prep_next, has_next, next, skip, cancel}`
//! capability set: each concrete iterator here implements the subset it
//! actually needs and leaves the rest at the trait's default (a no-op or
//! `None`), rather than forcing every variant to support the full set.

pub mod immutable;
pub mod merged;
pub mod modlist;
pub mod range;

use crate::value::VersionedEntry;

/// Outcome of a `prep_next` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrepResult {
    /// An entry is ready; the next `next()` call will return it.
    Ready,
    /// Nothing left to produce.
    Done,
    /// A component iterator could not make progress synchronously (e.g.
    /// it is waiting on a block-cache read); the caller should register
    /// a callback and retry later (spec §4.3 asynchrony note).
    WouldBlock,
}

/// The capability set every pull-based iterator variant implements a
/// subset of. Callers document which operations they actually require;
/// unsupported operations keep their default (a no-op, or `Done`/`None`
/// as appropriate) rather than panicking, since the specification
/// explicitly allows `None` for unsupported operations per variant.
pub trait PullIterator: Send {
    /// Prepares the next entry without consuming it. Must be called
    /// before `next()` produces a value for the first time, and again
    /// after `next()` so the following `has_next`/`next` pair is valid.
    fn prep_next(&mut self) -> PrepResult;

    /// Whether a prepared entry is available. Only meaningful after
    /// `prep_next` returned [`PrepResult::Ready`].
    fn has_next(&self) -> bool;

    /// Consumes and returns the prepared entry, or `None` if exhausted.
    fn next(&mut self) -> Option<VersionedEntry>;

    /// Registers a callback to be invoked once a `WouldBlock` condition
    /// clears, letting the caller re-enter `prep_next` (spec §4.3). The
    /// default is a no-op: synchronous iterators (the common case in
    /// this implementation, since the reference block cache never
    /// blocks) never need it.
    fn register_cb(&mut self, _callback: Box<dyn FnMut() + Send>) {}

    /// Forwards every cached/buffered position whose key is strictly
    /// less than `key`, discarding it (spec §4.3 `skip(k)`). The default
    /// is a no-op; only the merged iterator and its components need it.
    fn skip(&mut self, _key: &crate::key::Key) {}

    /// Releases all held resources (cache blocks, CT references). Legal
    /// at any point (spec §4.1 cancellation note). The default is a
    /// no-op for iterators that hold nothing beyond owned buffers.
    fn cancel(&mut self) {}
}
