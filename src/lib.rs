// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A versioned, log-structured storage engine built around a doubling
//! array of merging component trees.
//!
//! ##### NOTE
//!
//! > This crate implements the doubling array and its component trees.
//! > It does not ship a network protocol, a write-ahead log, or a block
//! > device allocator — those are external collaborators
//! > ([`ExtentAllocator`], [`block_cache::Cep`]) the embedding
//! > application supplies.
//!
//! ##### About
//!
//! A [`DoublingArray`] is a leveled collection of [`ComponentTree`]s.
//! Level 0 and level 1 are mutable in place, written to directly by
//! foreground inserts; every level above that is immutable, produced
//! only as merge output. Reads walk the levels newest-first, and a
//! single key can be live in several versions at once — each entry
//! carries a [`Version`] forming a DAG, and a read at version `v` sees
//! the newest entry that is `v` or an ancestor of `v`.
//!
//! Keeping a flat collection of component trees small enough to read
//! efficiently is the job of the merge engine: per-level merges fold
//! adjacent trees on the same level into one output tree one level up
//! ([`merge::normal_merge_output_level`]), deamortized across many small
//! units rather than done in one blocking pass
//! ([`da::scheduler::Scheduler`]). A total merge instead folds every
//! tree above level 0 into a single tree in one pass, triggered once
//! enough tombstones have accumulated at the top level
//! ([`da::total_merge::should_mark_compacting`]).
//!
//! # Example usage
//!
//! ```no_run
//! use doubling_array::{Config, DoublingArray};
//! use doubling_array::btree::{ro_vlba, rw_vlba};
//! use doubling_array::extent::InMemoryExtentAllocator;
//! use doubling_array::key::LexicographicComparator;
//! use doubling_array::version::{InMemoryVersionService, ROOT_VERSION};
//! use std::sync::Arc;
//!
//! let comparator = Arc::new(LexicographicComparator);
//! let da = DoublingArray::new(
//!     1,
//!     ROOT_VERSION,
//!     Config::new().cpu_count(4).level_count(16),
//!     rw_vlba(Arc::clone(&comparator)),
//!     ro_vlba(comparator),
//!     Arc::new(InMemoryExtentAllocator::new(1 << 20)),
//!     Arc::new(InMemoryVersionService::new()),
//! );
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

pub mod block_cache;
pub mod btree;
pub mod checkpoint;
pub mod coding;
pub mod component_tree;
pub mod config;
pub mod da;
pub mod error;
pub mod extent;
pub mod filter;
pub mod iter;
pub mod key;
pub mod merge;
pub mod registry;
pub mod value;
pub mod version;

pub use component_tree::ComponentTree;
pub use config::Config;
pub use da::DoublingArray;
pub use error::{Error, Result};
pub use version::Version;
