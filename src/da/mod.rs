// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The doubling array: the collection of levels, their lifecycle, and the
//! list-membership bookkeeping merges and promotions mutate (spec §3, §5).
//!
//! Grounded on `src/levels/mod.rs`'s `LevelManifest` (`Vec<Level>`, a
//! hidden set masking segments mid-compaction rather than removing them,
//! atomic rewrite-on-swap), generalized from fjall's single compaction
//! strategy to the DA's level-0/level-1 dynamic trees, reference-counted
//! CT lifetime, and growing/freeze bit protocols of spec §3/§5/§7. The
//! hidden set doubles as this crate's answer to the "intrusive list
//! membership as identity" design note (spec §9): a CT logically
//! `Attached` to a level always lives in `Level::trees`; `hidden`
//! additionally marks it `Detached` from new-merge eligibility while a
//! merge or total-merge already has it as an input, without requiring a
//! separate sentinel pointer scheme.

pub mod dispatch;
pub mod scheduler;
pub mod total_merge;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::btree::NodeOps;
use crate::component_tree::{pack_seq, ComponentTree, Seq};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extent::ExtentAllocator;
use crate::version::{Version, VersionService};

const FROZEN_BIT: u8 = 0b01;
const UNFROZEN_BIT: u8 = 0b10;

/// One level of the doubling array: its CTs, newest-first (invariant 4),
/// plus the set of CTs currently hidden from new-merge selection because
/// they are already an input to a merge or total-merge in flight.
#[derive(Default)]
pub struct Level {
    trees: Vec<Arc<ComponentTree>>,
    hidden: HashSet<Seq>,
}

impl Level {
    /// All CTs in this level, hidden or not, for invariant checks and
    /// checkpointing.
    #[must_use]
    pub fn trees(&self) -> &[Arc<ComponentTree>] {
        &self.trees
    }

    /// CTs not currently hidden: the set a new merge may pick inputs from.
    #[must_use]
    pub fn visible_trees(&self) -> Vec<Arc<ComponentTree>> {
        self.trees
            .iter()
            .filter(|ct| !self.hidden.contains(&ct.seq))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    #[must_use]
    pub fn visible_len(&self) -> usize {
        self.trees.len() - self.hidden.len()
    }

    fn insert_front(&mut self, ct: Arc<ComponentTree>) {
        self.trees.insert(0, ct);
    }

    fn remove(&mut self, seq: Seq) -> Option<Arc<ComponentTree>> {
        let idx = self.trees.iter().position(|ct| ct.seq == seq)?;
        self.hidden.remove(&seq);
        Some(self.trees.remove(idx))
    }

    fn hide(&mut self, seq: Seq) {
        self.hidden.insert(seq);
    }

    fn show(&mut self, seq: Seq) {
        self.hidden.remove(&seq);
    }
}

/// The doubling array: levels, lifecycle bits, and the counters the
/// merge/dispatch/total-merge machinery (in the sibling `da` modules)
/// drive. Does not itself own any threads — the per-level merge threads,
/// the total-merge thread, and the throttle timer are owned by whatever
/// embeds this struct, per spec §5's "parallel: each DA has one merge
/// thread per level" scheduling model; this module supplies the state
/// those threads synchronize on.
pub struct DoublingArray {
    pub id: u64,
    pub root_version: Version,
    config: Config,
    rw_ops: Arc<dyn NodeOps>,
    ro_ops: Arc<dyn NodeOps>,
    allocator: Arc<dyn ExtentAllocator>,
    versions: Arc<dyn VersionService>,
    levels: RwLock<Vec<Level>>,
    /// Per-CPU seq counters for level-0/1 CTs (cpu-index-prefixed, spec §3
    /// `seq`).
    next_cpu_seq: Vec<AtomicU64>,
    /// Seq counter for level ≥2 merge output, which carries no CPU prefix.
    next_merge_seq: AtomicU64,
    attach_count: AtomicU64,
    /// The DA's own reference count (design note §9): one held by the
    /// creator/registry, one more per live merge/total-merge thread,
    /// dropped on thread exit.
    da_ref_count: AtomicU64,
    freeze_bits: AtomicU8,
    growing: AtomicBool,
    compacting: AtomicBool,
    nr_del_versions: AtomicU64,
    exiting: AtomicBool,
    deleted: AtomicBool,
}

impl DoublingArray {
    /// Creates a freshly attached DA: one dynamic level-0 CT per
    /// configured request CPU (invariant 5), all higher levels empty.
    #[must_use]
    pub fn new(
        id: u64,
        root_version: Version,
        config: Config,
        rw_ops: Arc<dyn NodeOps>,
        ro_ops: Arc<dyn NodeOps>,
        allocator: Arc<dyn ExtentAllocator>,
        versions: Arc<dyn VersionService>,
    ) -> Self {
        let mut levels: Vec<Level> = (0..config.level_count).map(|_| Level::default()).collect();
        let next_cpu_seq: Vec<AtomicU64> = (0..config.cpu_count).map(|_| AtomicU64::new(1)).collect();

        if let Some(level0) = levels.first_mut() {
            for cpu in 0..config.cpu_count {
                #[allow(clippy::cast_possible_truncation)]
                let ct = ComponentTree::new_dynamic(pack_seq(cpu as u16, 0), 0, Arc::clone(&rw_ops));
                level0.insert_front(Arc::new(ct));
            }
        }

        log::debug!("doubling array {id} created at root version {root_version}, {} levels, {} cpus", config.level_count, config.cpu_count);

        Self {
            id,
            root_version,
            config,
            rw_ops,
            ro_ops,
            allocator,
            versions,
            levels: RwLock::new(levels),
            next_cpu_seq,
            next_merge_seq: AtomicU64::new(1),
            attach_count: AtomicU64::new(0),
            da_ref_count: AtomicU64::new(1),
            freeze_bits: AtomicU8::new(0),
            growing: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            nr_del_versions: AtomicU64::new(0),
            exiting: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    /// Reopens a DA from its persisted [`crate::checkpoint::DaEntry`]
    /// (spec §9's "Open question": per-CPU `nr_trees` balance at level 0
    /// can drift if the CPU count changes across restarts). Refuses to
    /// mount rather than guess: if `entry.cpu_count` doesn't match
    /// `config.cpu_count`, returns [`Error::Invalid`] instead of building
    /// a DA whose level-0 CT-per-CPU invariant no longer holds.
    ///
    /// Level 0 is rebuilt empty either way (spec §6: level-0 CTs are
    /// never checkpointed); the caller restores levels ≥1 from the
    /// `CtEntry` records it already has by its own means after this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] if `entry.cpu_count` doesn't match
    /// `config.cpu_count`.
    pub fn recover(
        entry: &crate::checkpoint::DaEntry,
        config: Config,
        rw_ops: Arc<dyn NodeOps>,
        ro_ops: Arc<dyn NodeOps>,
        allocator: Arc<dyn ExtentAllocator>,
        versions: Arc<dyn VersionService>,
    ) -> Result<Self> {
        if entry.cpu_count != config.cpu_count as u64 {
            return Err(Error::Invalid(
                "persisted DA cpu_count does not match Config::cpu_count",
            ));
        }
        Ok(Self::new(entry.id, entry.root_version, config, rw_ops, ro_ops, allocator, versions))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn rw_ops(&self) -> &Arc<dyn NodeOps> {
        &self.rw_ops
    }

    #[must_use]
    pub fn ro_ops(&self) -> &Arc<dyn NodeOps> {
        &self.ro_ops
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<dyn ExtentAllocator> {
        &self.allocator
    }

    #[must_use]
    pub fn versions(&self) -> &Arc<dyn VersionService> {
        &self.versions
    }

    #[must_use]
    pub fn depth(&self) -> u8 {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        #[allow(clippy::cast_possible_truncation)]
        let len = self.levels.read().expect("lock poisoned").len() as u8;
        len
    }

    // ---- attach/detach/destroy (spec §3 Lifecycle, §6 control surface) ----

    pub fn attach(&self) {
        self.attach_count.fetch_add(1, Ordering::AcqRel);
    }

    /// # Panics
    ///
    /// Panics (invariant) if called more times than `attach`.
    pub fn detach(&self) {
        let prev = self.attach_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "detach without matching attach");
    }

    #[must_use]
    pub fn attach_count(&self) -> u64 {
        self.attach_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Marks the DA deleted, the first step of destruction (spec §3
    /// Lifecycle): only legal once every attachment has been released.
    /// The caller must still signal and join every merge/total-merge
    /// thread (each drops a `da_ref` on exit) before the DA is actually
    /// freed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if any attachment remains.
    pub fn destroy(&self) -> Result<()> {
        if self.attach_count() > 0 {
            return Err(Error::Busy);
        }
        self.deleted.store(true, Ordering::Release);
        self.exiting.store(true, Ordering::Release);
        log::debug!("doubling array {} marked for destruction", self.id);
        Ok(())
    }

    /// Takes a DA reference (design note §9: merge threads each hold one,
    /// taken at creation).
    pub fn acquire(&self) {
        self.da_ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a DA reference. Returns `true` if this was the last one.
    pub fn release(&self) -> bool {
        let prev = self.da_ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "da_ref_count underflow");
        prev == 1
    }

    #[must_use]
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    // ---- freeze/unfreeze (spec §7, two-bit protocol) ----

    /// Sets the frozen bit, unless a racing `unfreeze` already set the
    /// unfrozen bit — in that case both bits are cleared and freezing
    /// does not take effect, so a concurrent unfreeze can never be missed.
    pub fn freeze(&self) {
        loop {
            let old = self.freeze_bits.load(Ordering::Acquire);
            let new = if old & UNFROZEN_BIT != 0 {
                old & !(FROZEN_BIT | UNFROZEN_BIT)
            } else {
                old | FROZEN_BIT
            };
            if self
                .freeze_bits
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        log::warn!("doubling array {} froze (no space)", self.id);
    }

    /// Sets the unfrozen bit and clears the frozen bit. A `freeze` call
    /// racing with this one observes the unfrozen bit and backs off
    /// instead of re-freezing.
    pub fn unfreeze(&self) {
        loop {
            let old = self.freeze_bits.load(Ordering::Acquire);
            let new = (old | UNFROZEN_BIT) & !FROZEN_BIT;
            if self
                .freeze_bits
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        log::debug!("doubling array {} unfrozen", self.id);
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.freeze_bits.load(Ordering::Acquire) & FROZEN_BIT != 0
    }

    // ---- growing bit (spec §5, test-and-set lock) ----

    /// Attempts to take the growing bit (guards level-0 promotion races).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Contention`] if another caller already holds it;
    /// the caller should retry.
    pub fn try_enter_growing(&self) -> Result<()> {
        if self.growing.swap(true, Ordering::AcqRel) {
            Err(Error::Contention)
        } else {
            Ok(())
        }
    }

    pub fn exit_growing(&self) {
        self.growing.store(false, Ordering::Release);
    }

    // ---- compaction marking (spec §4.8) ----

    pub fn mark_compacting(&self) {
        self.compacting.store(true, Ordering::Release);
    }

    pub fn clear_compacting(&self) {
        self.compacting.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    pub fn add_del_versions(&self, n: u64) {
        self.nr_del_versions.fetch_add(n, Ordering::AcqRel);
    }

    #[must_use]
    pub fn nr_del_versions(&self) -> u64 {
        self.nr_del_versions.load(Ordering::Acquire)
    }

    pub fn reset_del_versions(&self) {
        self.nr_del_versions.store(0, Ordering::Release);
    }

    // ---- level queries ----

    #[must_use]
    pub fn level_len(&self, level: u8) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let levels = self.levels.read().expect("lock poisoned");
        levels.get(level as usize).map_or(0, Level::len)
    }

    #[must_use]
    pub fn level_visible_len(&self, level: u8) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let levels = self.levels.read().expect("lock poisoned");
        levels.get(level as usize).map_or(0, Level::visible_len)
    }

    /// The highest level holding any CT, or `None` if the whole DA is
    /// empty above level 0 (used by total-merge output placement, spec
    /// §4.5).
    #[must_use]
    pub fn highest_occupied_level(&self) -> Option<u8> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let levels = self.levels.read().expect("lock poisoned");
        levels
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, l)| !l.is_empty())
            .map(|(idx, _)| idx as u8)
    }

    /// The lowest level at or above 1 with ≥2 visible trees, or `None`.
    /// Used both for driver-merge selection (spec §4.6) and normal merge
    /// scheduling.
    #[must_use]
    pub fn lowest_level_with_two_trees(&self) -> Option<u8> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let levels = self.levels.read().expect("lock poisoned");
        levels
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, l)| l.visible_len() >= 2)
            .map(|(idx, _)| idx as u8)
    }

    /// The driver merge level per spec §4.6: the lowest eligible level
    /// when `dynamic_driver_merge` is set, otherwise fixed at level 1 (and
    /// only eligible if level 1 itself has ≥2 visible trees).
    #[must_use]
    pub fn driver_merge_level(&self) -> Option<u8> {
        if self.config.dynamic_driver_merge {
            self.lowest_level_with_two_trees()
        } else if self.level_visible_len(1) >= 2 {
            Some(1)
        } else {
            None
        }
    }

    /// Picks the two oldest visible CTs at `level` as a normal merge's
    /// inputs (the doubling array pairs trees pairwise), or `None` if
    /// fewer than two are eligible.
    #[must_use]
    pub fn pick_merge_inputs(&self, level: u8) -> Option<[Arc<ComponentTree>; 2]> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let levels = self.levels.read().expect("lock poisoned");
        let visible = levels.get(level as usize)?.visible_trees();
        let len = visible.len();
        if len < 2 {
            return None;
        }
        // Oldest two: the tail of the newest-first list.
        Some([visible[len - 2].clone(), visible[len - 1].clone()])
    }

    /// Snapshots every visible CT at level ≥1 (the total-merge input set,
    /// spec §4.8), hiding each one in the same pass so normal merges
    /// cannot also pick them up.
    #[must_use]
    pub fn snapshot_and_hide_for_total_merge(&self) -> Vec<Arc<ComponentTree>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut levels = self.levels.write().expect("lock poisoned");
        let mut out = Vec::new();
        for level in levels.iter_mut().skip(1) {
            for ct in level.visible_trees() {
                level.hide(ct.seq);
                out.push(ct);
            }
        }
        out
    }

    /// Hides `seqs` at `level` so a merge about to run on them is not
    /// picked again by a concurrent scheduling attempt.
    pub fn hide_for_merge(&self, level: u8, seqs: &[Seq]) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut levels = self.levels.write().expect("lock poisoned");
        if let Some(l) = levels.get_mut(level as usize) {
            for seq in seqs {
                l.hide(*seq);
            }
        }
    }

    /// Reverses `hide_for_merge` after a merge fails, so its inputs become
    /// eligible again (spec §7: "on error, it retains the input CTs").
    pub fn abort_merge(&self, level: u8, seqs: &[Seq]) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut levels = self.levels.write().expect("lock poisoned");
        if let Some(l) = levels.get_mut(level as usize) {
            for seq in seqs {
                l.show(*seq);
            }
        }
        log::debug!("doubling array {} aborted merge at level {level}, inputs restored", self.id);
    }

    /// Commits a completed merge (spec invariant 6): removes every input
    /// CT from `input_level` and inserts `output` at `output_level`,
    /// atomically under the levels lock so a concurrent reader snapshot
    /// never observes a half-swapped state. An input whose `put()` drops
    /// its last reference has its owned extents freed back to this DA's
    /// allocator (invariant 3).
    ///
    /// # Panics
    ///
    /// Panics if `output_level` is out of range for this DA's configured
    /// level count.
    pub fn commit_merge(
        &self,
        input_level: u8,
        input_seqs: &[Seq],
        output_level: u8,
        output: Arc<ComponentTree>,
    ) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut levels = self.levels.write().expect("lock poisoned");
        if let Some(l) = levels.get_mut(input_level as usize) {
            for seq in input_seqs {
                if let Some(ct) = l.remove(*seq) {
                    if ct.put() {
                        ct.free_owned_extents(self.allocator.as_ref());
                    }
                }
            }
        }
        let out_level = levels
            .get_mut(output_level as usize)
            .expect("output_level must be within the DA's configured level count");
        out_level.insert_front(output);
        log::trace!(
            "doubling array {} merge committed: {} inputs at level {input_level} -> 1 output at level {output_level}",
            self.id,
            input_seqs.len()
        );
    }

    /// Commits a total merge's output (spec §4.8): like [`Self::commit_merge`]
    /// but `inputs` may span every level ≥1, since a total merge snapshots
    /// the whole DA above level 0 in one pass
    /// ([`Self::snapshot_and_hide_for_total_merge`]). Also frees owned
    /// extents for any input that loses its last reference here.
    ///
    /// # Panics
    ///
    /// Panics if `output_level` is out of range for this DA's configured
    /// level count.
    pub fn commit_total_merge(&self, inputs: &[Arc<ComponentTree>], output_level: u8, output: Arc<ComponentTree>) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut levels = self.levels.write().expect("lock poisoned");
        for ct in inputs {
            if let Some(l) = levels.get_mut(ct.level as usize) {
                if let Some(removed) = l.remove(ct.seq) {
                    if removed.put() {
                        removed.free_owned_extents(self.allocator.as_ref());
                    }
                }
            }
        }
        let out_level = levels
            .get_mut(output_level as usize)
            .expect("output_level must be within the DA's configured level count");
        out_level.insert_front(output);
        log::trace!(
            "doubling array {} total merge committed: {} inputs -> 1 output at level {output_level}",
            self.id,
            inputs.len()
        );
    }

    /// Reverses [`Self::snapshot_and_hide_for_total_merge`] after a total
    /// merge fails, un-hiding every input so normal per-level merges can
    /// pick them up again (spec §7: total-merge failures restore the CTs'
    /// compacting state).
    pub fn abort_total_merge(&self, inputs: &[Arc<ComponentTree>]) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut levels = self.levels.write().expect("lock poisoned");
        for ct in inputs {
            if let Some(l) = levels.get_mut(ct.level as usize) {
                l.show(ct.seq);
            }
        }
        log::debug!("doubling array {} total merge aborted, {} inputs restored", self.id, inputs.len());
    }

    // ---- level-0 promotion (spec §3 `RWCT` lifecycle, `rwct_make`) ----

    #[must_use]
    fn next_cpu_tree_seq(&self, cpu_index: usize) -> Seq {
        #[allow(clippy::cast_possible_truncation)]
        let cpu = cpu_index as u16;
        let counter = self.next_cpu_seq[cpu_index].fetch_add(1, Ordering::AcqRel);
        pack_seq(cpu, counter)
    }

    /// Returns `cpu_index`'s current level-0 CT.
    #[must_use]
    pub fn level0_tree(&self, cpu_index: usize) -> Option<Arc<ComponentTree>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let levels = self.levels.read().expect("lock poisoned");
        levels.first()?.trees.iter().find(|ct| cpu_of(ct.seq) == cpu_index as u16).cloned()
    }

    /// Demotes `cpu_index`'s current level-0 CT to level 1 and installs a
    /// fresh, empty one in its place (invariant 5). Guarded by the
    /// growing bit: callers that lose the race get [`Error::Contention`]
    /// and should retry (spec §7, `rwct_make` returns `EAGAIN` on races).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Contention`] if the growing bit is already held,
    /// or [`Error::NotFound`] if `cpu_index` has no current level-0 CT.
    pub fn promote_level0(&self, cpu_index: usize) -> Result<Arc<ComponentTree>> {
        self.try_enter_growing()?;
        let result = (|| {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut levels = self.levels.write().expect("lock poisoned");
            if levels.len() < 2 {
                return Err(Error::Internal("DA must be configured with at least 2 levels"));
            }
            let (head, rest) = levels.split_at_mut(1);
            let level0 = &mut head[0];
            let level1 = &mut rest[0];

            let idx = level0
                .trees
                .iter()
                .position(|ct| cpu_of(ct.seq) == cpu_index as u16)
                .ok_or(Error::NotFound)?;
            // Demotion only changes which level's list the CT lives in;
            // it stays dynamic and writable (spec §3: level 1 is still a
            // mutable former level-0 tree).
            let old = level0.trees.remove(idx);
            level1.insert_front(old);

            #[allow(clippy::cast_possible_truncation)]
            let fresh = ComponentTree::new_dynamic(
                pack_seq(cpu_index as u16, 0),
                0,
                Arc::clone(&self.rw_ops),
            );
            let fresh = Arc::new(fresh);
            level0.insert_front(Arc::clone(&fresh));
            Ok(fresh)
        })();
        self.exit_growing();
        if result.is_ok() {
            log::debug!("doubling array {} promoted cpu {cpu_index}'s level-0 tree to level 1", self.id);
        }
        result
    }

    /// Allocates the next seq for a merge output CT at level ≥2 (no CPU
    /// prefix; invariant 4 only requires monotonic recency ordering here).
    #[must_use]
    pub fn next_merge_output_seq(&self) -> Seq {
        pack_seq(0, self.next_merge_seq.fetch_add(1, Ordering::AcqRel))
    }
}

#[must_use]
fn cpu_of(seq: Seq) -> u16 {
    #[allow(clippy::cast_possible_truncation)]
    {
        (seq >> 48) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{ro_vlba, rw_vlba};
    use crate::extent::InMemoryExtentAllocator;
    use crate::key::LexicographicComparator;
    use crate::version::InMemoryVersionService;

    fn da(cpu_count: usize, level_count: u8) -> DoublingArray {
        let comparator = Arc::new(LexicographicComparator);
        DoublingArray::new(
            1,
            crate::version::ROOT_VERSION,
            Config::new().cpu_count(cpu_count).level_count(level_count),
            rw_vlba(Arc::clone(&comparator)),
            ro_vlba(comparator),
            Arc::new(InMemoryExtentAllocator::new(10_000)),
            Arc::new(InMemoryVersionService::new()),
        )
    }

    #[test]
    fn new_da_seeds_one_level0_tree_per_cpu() {
        let d = da(3, 4);
        assert_eq!(d.level_len(0), 3);
        for cpu in 0..3 {
            assert!(d.level0_tree(cpu).is_some());
        }
    }

    #[test]
    fn recover_rejects_mismatched_persisted_cpu_count() {
        let comparator = Arc::new(LexicographicComparator);
        let entry = crate::checkpoint::DaEntry { id: 1, root_version: crate::version::ROOT_VERSION, cpu_count: 3 };
        let err = DoublingArray::recover(
            &entry,
            Config::new().cpu_count(4).level_count(4),
            rw_vlba(Arc::clone(&comparator)),
            ro_vlba(comparator),
            Arc::new(InMemoryExtentAllocator::new(10_000)),
            Arc::new(InMemoryVersionService::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn recover_accepts_matching_persisted_cpu_count() {
        let comparator = Arc::new(LexicographicComparator);
        let entry = crate::checkpoint::DaEntry { id: 1, root_version: crate::version::ROOT_VERSION, cpu_count: 4 };
        let d = DoublingArray::recover(
            &entry,
            Config::new().cpu_count(4).level_count(4),
            rw_vlba(Arc::clone(&comparator)),
            ro_vlba(comparator),
            Arc::new(InMemoryExtentAllocator::new(10_000)),
            Arc::new(InMemoryVersionService::new()),
        )
        .unwrap();
        assert_eq!(d.level_len(0), 4);
    }

    #[test]
    fn destroy_fails_while_attached() {
        let d = da(1, 4);
        d.attach();
        assert!(matches!(d.destroy(), Err(Error::Busy)));
        d.detach();
        assert!(d.destroy().is_ok());
        assert!(d.is_deleted());
    }

    #[test]
    fn freeze_unfreeze_round_trip() {
        let d = da(1, 4);
        assert!(!d.is_frozen());
        d.freeze();
        assert!(d.is_frozen());
        d.unfreeze();
        assert!(!d.is_frozen());
    }

    #[test]
    fn racing_unfreeze_suppresses_a_concurrent_freeze() {
        let d = da(1, 4);
        // Unfreeze first (nothing was frozen, but it still sets the
        // unfrozen bit), then freeze must back off rather than stick.
        d.unfreeze();
        d.freeze();
        assert!(!d.is_frozen());
    }

    #[test]
    fn growing_bit_is_exclusive() {
        let d = da(1, 4);
        d.try_enter_growing().unwrap();
        assert!(matches!(d.try_enter_growing(), Err(Error::Contention)));
        d.exit_growing();
        assert!(d.try_enter_growing().is_ok());
    }

    #[test]
    fn promote_level0_moves_old_tree_to_level1() {
        let d = da(2, 4);
        let old = d.level0_tree(0).unwrap();
        let fresh = d.promote_level0(0).unwrap();
        assert_ne!(old.seq, fresh.seq);
        assert_eq!(d.level_len(0), 2);
        assert_eq!(d.level_len(1), 1);
        assert_eq!(d.level0_tree(0).unwrap().seq, fresh.seq);
    }

    #[test]
    fn driver_merge_level_picks_lowest_eligible_level() {
        let d = da(1, 4);
        assert_eq!(d.driver_merge_level(), None);

        // Fabricate two CTs directly into level 1 to simulate two
        // promotions having already happened.
        let comparator = Arc::new(LexicographicComparator);
        let ops = rw_vlba(comparator);
        {
            let mut levels = d.levels.write().unwrap();
            let l1 = &mut levels[1];
            l1.insert_front(Arc::new(ComponentTree::new_dynamic(pack_seq(0, 1), 1, Arc::clone(&ops))));
            l1.insert_front(Arc::new(ComponentTree::new_dynamic(pack_seq(0, 2), 1, ops)));
        }
        assert_eq!(d.driver_merge_level(), Some(1));
    }

    #[test]
    fn commit_merge_removes_inputs_and_inserts_output_atomically() {
        let d = da(1, 4);
        let comparator = Arc::new(LexicographicComparator);
        let ops = rw_vlba(Arc::clone(&comparator));
        let a = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 1), 1, Arc::clone(&ops)));
        let b = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 2), 1, ops));
        let (seq_a, seq_b) = (a.seq, b.seq);
        {
            let mut levels = d.levels.write().unwrap();
            levels[1].insert_front(a);
            levels[1].insert_front(b);
        }

        let output = Arc::new(ComponentTree::new_immutable(d.next_merge_output_seq(), 2, ro_vlba(comparator)));
        d.commit_merge(1, &[seq_a, seq_b], 2, Arc::clone(&output));

        assert_eq!(d.level_len(1), 0);
        assert_eq!(d.level_len(2), 1);
        assert_eq!(d.level0_tree(0).is_some(), true);
    }

    #[test]
    fn hide_for_merge_excludes_from_visible_but_not_total_len() {
        let d = da(1, 4);
        let comparator = Arc::new(LexicographicComparator);
        let ops = rw_vlba(comparator);
        let a = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 1), 1, Arc::clone(&ops)));
        let b = Arc::new(ComponentTree::new_dynamic(pack_seq(0, 2), 1, ops));
        let (seq_a, _seq_b) = (a.seq, b.seq);
        {
            let mut levels = d.levels.write().unwrap();
            levels[1].insert_front(a);
            levels[1].insert_front(b);
        }

        d.hide_for_merge(1, &[seq_a]);
        assert_eq!(d.level_len(1), 2);
        assert_eq!(d.level_visible_len(1), 1);

        d.abort_merge(1, &[seq_a]);
        assert_eq!(d.level_visible_len(1), 2);
    }
}
