// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The process-wide DA/CT registry (spec §9 "Global mutable state").
//!
//! The design note calls for two process-wide hash tables (DA and CT)
//! plus a next-id counter, packaged as a module-scoped singleton created
//! at `init` and destroyed at `fini` rather than left as ambient statics.
//! `OnceLock` gives us the "created once, explicitly" half of that; it
//! cannot be un-set, so `fini` clears the tables back to empty instead of
//! tearing down the lock itself — the same shape the note's "explicit
//! lifecycle entry points" guidance asks for, adapted to what safe Rust
//! actually allows a `static` to do. The throttle timer the note also
//! mentions is out of scope here: it is the 10 Hz tick that drives
//! [`crate::da::dispatch::Dispatcher::replenish`], owned by whatever
//! embeds this crate (spec §5), not by the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::component_tree::{ComponentTree, Seq};
use crate::da::DoublingArray;
use crate::error::{Error, Result};

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The two process-wide tables plus the next-id counter the design note
/// names.
pub struct Registry {
    das: RwLock<HashMap<u64, Arc<DoublingArray>>>,
    cts: RwLock<HashMap<(u64, Seq), Arc<ComponentTree>>>,
    next_da_id: AtomicU64,
}

impl Registry {
    fn new() -> Self {
        Self {
            das: RwLock::new(HashMap::new()),
            cts: RwLock::new(HashMap::new()),
            next_da_id: AtomicU64::new(1),
        }
    }

    /// Allocates the next process-wide DA id.
    #[must_use]
    pub fn next_da_id(&self) -> u64 {
        self.next_da_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Registers `da` under its own id. Replaces any prior entry with the
    /// same id (a restart recovering the same on-disk DA, for instance).
    pub fn insert_da(&self, da: Arc<DoublingArray>) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.das.write().expect("lock poisoned").insert(da.id, da);
    }

    #[must_use]
    pub fn get_da(&self, id: u64) -> Option<Arc<DoublingArray>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.das.read().expect("lock poisoned").get(&id).cloned()
    }

    /// Removes a DA from the registry. Called once `destroy` has
    /// succeeded and every merge/total-merge thread has dropped its DA
    /// reference (spec §9 "Cyclic references").
    pub fn remove_da(&self, id: u64) -> Option<Arc<DoublingArray>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.das.write().expect("lock poisoned").remove(&id)
    }

    #[must_use]
    pub fn da_count(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.das.read().expect("lock poisoned").len()
    }

    pub fn insert_ct(&self, da_id: u64, ct: Arc<ComponentTree>) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.cts.write().expect("lock poisoned").insert((da_id, ct.seq), ct);
    }

    #[must_use]
    pub fn get_ct(&self, da_id: u64, seq: Seq) -> Option<Arc<ComponentTree>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.cts.read().expect("lock poisoned").get(&(da_id, seq)).cloned()
    }

    pub fn remove_ct(&self, da_id: u64, seq: Seq) -> Option<Arc<ComponentTree>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.cts.write().expect("lock poisoned").remove(&(da_id, seq))
    }

    #[must_use]
    pub fn ct_count(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.cts.read().expect("lock poisoned").len()
    }

    fn clear(&self) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.das.write().expect("lock poisoned").clear();
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.cts.write().expect("lock poisoned").clear();
    }
}

/// Creates the process-wide registry. Idempotent: a second call is a
/// no-op rather than an error, since an embedder may call it defensively
/// from more than one entry point.
pub fn init() {
    let _ = REGISTRY.set(Registry::new());
}

/// Clears both tables back to empty (spec §9: "destroyed at `fini`").
/// Does not release the underlying `OnceLock` itself — see the module
/// doc comment — so `init` need not be called again afterwards.
///
/// # Errors
///
/// Returns [`Error::Invalid`] if the registry was never initialized.
pub fn fini() -> Result<()> {
    let registry = REGISTRY.get().ok_or(Error::Invalid("registry not initialized"))?;
    registry.clear();
    Ok(())
}

/// Accesses the process-wide registry.
///
/// # Errors
///
/// Returns [`Error::Invalid`] if [`init`] has not been called yet.
pub fn get() -> Result<&'static Registry> {
    REGISTRY.get().ok_or(Error::Invalid("registry not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{ro_vlba, rw_vlba};
    use crate::component_tree::pack_seq;
    use crate::config::Config;
    use crate::extent::InMemoryExtentAllocator;
    use crate::key::LexicographicComparator;
    use crate::version::InMemoryVersionService;

    // A fresh `Registry` per test rather than the process-wide singleton:
    // `#[test]` functions run concurrently in one process, and the
    // singleton above is intentionally global (one per embedding
    // process), so sharing it across tests would make them interfere.
    fn fresh_registry() -> Registry {
        Registry::new()
    }

    fn da(id: u64) -> Arc<DoublingArray> {
        let comparator = Arc::new(LexicographicComparator);
        Arc::new(DoublingArray::new(
            id,
            crate::version::ROOT_VERSION,
            Config::new().cpu_count(1).level_count(4),
            rw_vlba(Arc::clone(&comparator)),
            ro_vlba(comparator),
            Arc::new(InMemoryExtentAllocator::new(1_000)),
            Arc::new(InMemoryVersionService::new()),
        ))
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let reg = fresh_registry();
        let d = da(1);
        reg.insert_da(Arc::clone(&d));
        assert_eq!(reg.da_count(), 1);
        assert!(reg.get_da(1).is_some());
        assert!(reg.remove_da(1).is_some());
        assert!(reg.get_da(1).is_none());
    }

    #[test]
    fn next_da_id_is_monotonic() {
        let reg = fresh_registry();
        let a = reg.next_da_id();
        let b = reg.next_da_id();
        assert!(b > a);
    }

    #[test]
    fn ct_table_is_keyed_by_da_id_and_seq() {
        let reg = fresh_registry();
        let comparator = Arc::new(LexicographicComparator);
        let ct = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 1), 0, rw_vlba(comparator)));
        reg.insert_ct(1, Arc::clone(&ct));
        assert!(reg.get_ct(1, ct.seq).is_some());
        assert!(reg.get_ct(2, ct.seq).is_none());
        assert_eq!(reg.ct_count(), 1);
    }

    #[test]
    fn singleton_init_is_idempotent_and_fini_clears_it() {
        init();
        init();
        let reg = get().unwrap();
        reg.insert_da(da(99));
        assert!(reg.da_count() >= 1);
        fini().unwrap();
        assert_eq!(get().unwrap().da_count(), 0);
    }
}
