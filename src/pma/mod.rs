//! The packed memory array behind one graph partition.
//!
//! [`PackedCsr`] keeps every edge of its vertex range in a single sparse,
//! sorted array: each vertex owns a sentinel slot followed by its outgoing
//! edges ordered by destination, with controlled gaps so inserts move few
//! elements. Leaves of `log_n` slots carry [`HybridLock`]s; a partition-wide
//! [`ResizeGate`] protects array doubling/halving.
//!
//! # Locking protocol
//!
//! Every operation holds the gate in shared mode. A mutation then:
//! 1. binary-searches for the target index (optimistically, or under shared
//!    leaf locks),
//! 2. plans the exact leaf set its slide + redistribute will touch and
//!    locks those leaves exclusively in ascending order,
//! 3. re-validates the observed leaf version and insertion index, retrying
//!    from scratch on interference (bounded, then escalating to the
//!    exclusive gate, which always succeeds),
//! 4. mutates, then releases each leaf with a version bump.
//!
//! # Safety model
//!
//! `Store` lives in an `UnsafeCell`. Slot words and vertex fields are
//! atomics, so concurrent readers and writers never race at the language
//! level; *structural* mutation (swapping the slot array, growing the leaf
//! lock table or the vertex table) happens only under the exclusive gate,
//! while every other accessor holds it shared. `&mut Store` is therefore
//! created only in resize/append paths, where the gate guarantees no other
//! reference exists.

mod geometry;
mod plan;
mod rebalance;
mod search;
pub mod slot;

use std::cell::UnsafeCell;

use crossbeam_utils::CachePadded;

use crate::sync::{HybridLock, ResizeGate};
use geometry::Geometry;
use plan::{InsertLockOutcome, RemoveLockOutcome};
use slot::{RawSlot, SlotCell, VertexRecord};

/// How mutations locate their target index.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SearchMode {
    /// Take shared leaf locks over the vertex's range while searching.
    #[default]
    Locked,
    /// Search without locks; record leaf versions and validate later.
    Optimistic,
}

/// Retries before an operation gives up on fine-grained locking and takes
/// the gate exclusively.
const MAX_RETRIES: u32 = 3;

pub(crate) struct Store {
    pub(crate) geo: Geometry,
    pub(crate) slots: Vec<SlotCell>,
    pub(crate) leaf_locks: Vec<CachePadded<HybridLock>>,
    pub(crate) vertices: Vec<VertexRecord>,
}

impl Store {
    #[inline]
    pub(crate) fn slot(&self, index: usize) -> RawSlot {
        self.slots[index].load()
    }

    #[inline]
    pub(crate) fn set_slot(&self, index: usize, slot: RawSlot) {
        self.slots[index].store(slot);
    }

    #[inline]
    pub(crate) fn clear_slot(&self, index: usize) {
        self.slots[index].clear();
    }

    #[inline]
    pub(crate) fn leaf_lock(&self, leaf: usize) -> &HybridLock {
        &self.leaf_locks[leaf]
    }

    #[inline]
    pub(crate) fn vertex(&self, v: u32) -> &VertexRecord {
        &self.vertices[v as usize]
    }

    /// Non-empty slots in `[index, index + len)`.
    pub(crate) fn occupancy(&self, index: usize, len: usize) -> usize {
        let mut full = 0;
        for i in index..index + len {
            full += usize::from(!self.slot(i).is_empty());
        }
        full
    }

    /// Fraction of `[index, index + len)` occupied.
    #[inline]
    pub(crate) fn density(&self, index: usize, len: usize) -> f64 {
        self.occupancy(index, len) as f64 / len as f64
    }
}

/// A PMA-backed CSR partition: sentinels + sorted edges in one packed array.
pub struct PackedCsr {
    gate: ResizeGate,
    search_mode: SearchMode,
    domain: usize,
    store: UnsafeCell<Store>,
}

// SAFETY: all shared interior state is atomic; structural mutation of the
// boxed store happens only under the exclusive gate (see module docs).
unsafe impl Send for PackedCsr {}
unsafe impl Sync for PackedCsr {}

impl PackedCsr {
    /// Creates a partition holding `vertex_count` vertices and no edges.
    ///
    /// The array is sized with headroom above the vertex count and the
    /// sentinels are spread evenly, so the structure starts in a uniform
    /// state well inside its density bounds.
    pub fn new(vertex_count: u32, search_mode: SearchMode, domain: usize) -> Self {
        let geo = Geometry::for_vertices(vertex_count as usize);
        let slots: Vec<SlotCell> = (0..geo.n).map(|_| SlotCell::new_empty()).collect();
        let leaf_locks = (0..geo.leaf_count())
            .map(|_| CachePadded::new(HybridLock::new()))
            .collect();

        let mut vertices = Vec::with_capacity(vertex_count as usize);
        let count = vertex_count as usize;
        if count > 0 {
            let step = geo.n as f64 / count as f64;
            let mut index_d = 0.0f64;
            let mut begin = 0usize;
            for v in 0..count {
                index_d += step;
                let end = if v == count - 1 {
                    geo.n - 1
                } else {
                    index_d as usize
                };
                vertices.push(VertexRecord::new(begin as u32, end as u32));
                begin = end;
            }

            // Place one sentinel at each vertex's begin.
            for v in 0..count {
                let at = vertices[v].begin() as usize;
                slots[at].store(RawSlot::sentinel(v as u32));
            }
        }

        Self {
            gate: ResizeGate::new(),
            search_mode,
            domain,
            store: UnsafeCell::new(Store {
                geo,
                slots,
                leaf_locks,
                vertices,
            }),
        }
    }

    /// Shared view of the store.
    ///
    /// Sound whenever the caller holds the gate (either mode) or has
    /// otherwise excluded structural mutation; see the module docs.
    #[inline]
    pub(crate) fn store(&self) -> &Store {
        // SAFETY: per the protocol above, no `&mut Store` coexists.
        unsafe { &*self.store.get() }
    }

    /// Exclusive view of the store.
    ///
    /// # Safety
    ///
    /// Caller must hold the gate exclusively and must not hold any other
    /// reference into the store across this call.
    #[inline]
    pub(crate) unsafe fn store_mut(&self) -> &mut Store {
        &mut *self.store.get()
    }

    /// NUMA domain this partition prefers.
    pub fn domain(&self) -> usize {
        self.domain
    }

    /// The resize gate, for worker registration and quiescence probes.
    pub fn gate(&self) -> &ResizeGate {
        &self.gate
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.store().vertices.len()
    }

    /// Current neighbor count of `v` (zero when out of range).
    ///
    /// Authoritative between operations; may drift transiently while a
    /// mutation on `v` is in flight (the optimistic bump).
    pub fn degree(&self, v: u32) -> usize {
        let store = self.store();
        if (v as usize) < store.vertices.len() {
            store.vertex(v).degree() as usize
        } else {
            0
        }
    }

    fn bump_degree(&self, src: u32) {
        self.store().vertex(src).inc_degree();
    }

    fn unbump_degree(&self, src: u32) {
        self.store().vertex(src).dec_degree();
    }

    /// Releases `[first, last]` leaf locks, bumping each version to tell
    /// optimistic readers the leaves changed.
    pub(crate) fn release_leaves(&self, first: usize, last: usize) {
        let store = self.store();
        for leaf in first..=last {
            let lock = store.leaf_lock(leaf);
            lock.bump_version();
            lock.unlock();
        }
    }

    /// Releases `[first, last]` leaf locks without version bumps (nothing
    /// was modified).
    pub(crate) fn release_leaves_no_bump(&self, first: usize, last: usize) {
        let store = self.store();
        for leaf in first..=last {
            store.leaf_lock(leaf).unlock();
        }
    }

    /// Inserts edge `(src, dest)` with the given non-zero weight.
    ///
    /// Overwrites the weight if the edge already exists. Silent no-op when
    /// `weight == 0` or `src` is out of range.
    pub fn add_edge(&self, src: u32, dest: u32, weight: u32) {
        if weight == 0 {
            return;
        }
        let elem = RawSlot::edge(src, dest, weight);
        let mut retries = 0u32;
        loop {
            if (src as usize) >= self.vertex_count() {
                return;
            }
            if retries > MAX_RETRIES {
                tracing::trace!(src, dest, "insert retries exhausted, escalating");
                self.gate.lock();
                self.bump_degree(src);
                let store = self.store();
                let v = store.vertex(src);
                let hit =
                    self.binary_search(dest, v.begin() as usize + 1, v.end() as usize, false);
                if self.insert_at(hit.index, elem, src, None) {
                    self.unbump_degree(src);
                }
                self.gate.unlock();
                return;
            }

            self.gate.lock_shared();
            let store = self.store();
            let geo = store.geo;
            let begin = store.vertex(src).begin() as usize;
            let end = store.vertex(src).end() as usize;
            let first_leaf = geo.leaf_id(begin + 1);
            self.bump_degree(src);

            let hit = match self.search_mode {
                SearchMode::Locked => {
                    let last_leaf = geo.leaf_id(end);
                    for leaf in first_leaf..=last_leaf {
                        store.leaf_lock(leaf).lock_shared();
                    }
                    // More edges may have landed between reading the bounds
                    // and locking; restart so the search sees them.
                    if store.vertex(src).begin() as usize != begin
                        || store.vertex(src).end() as usize != end
                    {
                        for leaf in first_leaf..=last_leaf {
                            store.leaf_lock(leaf).unlock_shared();
                        }
                        self.unbump_degree(src);
                        self.gate.unlock_shared();
                        retries += 1;
                        continue;
                    }
                    self.binary_search(dest, begin + 1, end, true)
                }
                SearchMode::Optimistic => {
                    let hit = self.binary_search(dest, begin + 1, end, false);
                    // The range can slide left under us; a hit left of the
                    // observed first leaf means the search raced a rebalance.
                    if geo.leaf_id(geo.leaf_start(hit.index)) < first_leaf {
                        self.unbump_degree(src);
                        self.gate.unlock_shared();
                        retries += 1;
                        continue;
                    }
                    hit
                }
            };

            match self.plan_insert_locks(hit.index, elem, src, hit.leaf_version, None, 0) {
                InsertLockOutcome::Retry => {
                    self.unbump_degree(src);
                    self.gate.unlock_shared();
                    retries += 1;
                }
                InsertLockOutcome::GlobalWrite(plan) => {
                    self.gate.unlock_shared();
                    self.gate.lock();
                    let store = self.store();
                    let v = store.vertex(src);
                    let hit = self.binary_search(
                        dest,
                        v.begin() as usize + 1,
                        v.end() as usize,
                        false,
                    );
                    if self.insert_at(hit.index, elem, src, plan.as_ref()) {
                        self.unbump_degree(src);
                    }
                    self.gate.unlock();
                    return;
                }
                InsertLockOutcome::Locked { first, last, plan } => {
                    if self.insert_at(hit.index, elem, src, Some(&plan)) {
                        self.unbump_degree(src);
                    }
                    self.release_leaves(first, last);
                    self.gate.unlock_shared();
                    return;
                }
            }
        }
    }

    /// Removes edge `(src, dest)` if present; silent no-op otherwise.
    pub fn remove_edge(&self, src: u32, dest: u32) {
        let mut retries = 0u32;
        loop {
            if (src as usize) >= self.vertex_count() {
                return;
            }
            if retries > MAX_RETRIES {
                tracing::trace!(src, dest, "remove retries exhausted, escalating");
                self.gate.lock();
                let store = self.store();
                let v = store.vertex(src);
                let hit =
                    self.binary_search(dest, v.begin() as usize + 1, v.end() as usize, false);
                let found = hit.index < store.geo.n && {
                    let s = store.slot(hit.index);
                    !s.is_empty() && !s.is_sentinel() && s.dest == dest
                };
                if found {
                    self.unbump_degree(src);
                    self.remove_at(hit.index, dest);
                }
                self.gate.unlock();
                return;
            }

            self.gate.lock_shared();
            let store = self.store();
            let geo = store.geo;
            let begin = store.vertex(src).begin() as usize;
            let end = store.vertex(src).end() as usize;

            let (index, observed_version) = match self.search_mode {
                SearchMode::Locked => {
                    let first_leaf = geo.leaf_id(begin + 1);
                    let last_leaf = geo.leaf_id(end);
                    for leaf in first_leaf..=last_leaf {
                        store.leaf_lock(leaf).lock_shared();
                    }
                    if store.vertex(src).begin() as usize != begin
                        || store.vertex(src).end() as usize != end
                    {
                        for leaf in first_leaf..=last_leaf {
                            store.leaf_lock(leaf).unlock_shared();
                        }
                        self.gate.unlock_shared();
                        retries += 1;
                        continue;
                    }
                    let hit = self.binary_search(dest, begin + 1, end, false);
                    // Keep the version of the leaf we will remove from; the
                    // leaf itself cannot stay locked because the plan may
                    // first need locks to its left.
                    let version = store
                        .leaf_lock(geo.leaf_id(geo.leaf_start(hit.index)))
                        .version();
                    for leaf in first_leaf..=last_leaf {
                        store.leaf_lock(leaf).unlock_shared();
                    }
                    (hit.index, version)
                }
                SearchMode::Optimistic => {
                    let hit = self.binary_search(dest, begin + 1, end, false);
                    (hit.index, hit.leaf_version)
                }
            };

            self.unbump_degree(src);

            match self.plan_remove_locks(index, dest, src, observed_version, None, 0) {
                RemoveLockOutcome::NotFound => {
                    self.bump_degree(src);
                    self.gate.unlock_shared();
                    return;
                }
                RemoveLockOutcome::Retry => {
                    self.bump_degree(src);
                    self.gate.unlock_shared();
                    retries += 1;
                }
                RemoveLockOutcome::GlobalWrite => {
                    self.gate.unlock_shared();
                    self.gate.lock();
                    let store = self.store();
                    let v = store.vertex(src);
                    let hit = self.binary_search(
                        dest,
                        v.begin() as usize + 1,
                        v.end() as usize,
                        false,
                    );
                    let s = store.slot(hit.index);
                    if !s.is_empty() && !s.is_sentinel() && s.dest == dest {
                        self.remove_at(hit.index, dest);
                    } else {
                        self.bump_degree(src);
                    }
                    self.gate.unlock();
                    return;
                }
                RemoveLockOutcome::Locked { first, last } => {
                    self.remove_at(index, dest);
                    self.release_leaves(first, last);
                    self.gate.unlock_shared();
                    return;
                }
            }
        }
    }

    /// Whether edge `(src, dest)` currently exists.
    ///
    /// Linearizable: optimistic lookups validate the observed leaf version
    /// and vertex bounds, and fall back to a leaf-locked search when
    /// writers keep interfering.
    pub fn has_edge(&self, src: u32, dest: u32) -> bool {
        if (src as usize) >= self.vertex_count() {
            return false;
        }
        self.gate.lock_shared();
        // A lone version check can still be fooled by a commit that lands
        // inside the search itself, so accept only two consecutive stable
        // attempts that agree.
        let mut verdict = None;
        let mut prev: Option<bool> = None;
        for _ in 0..=MAX_RETRIES {
            let store = self.store();
            let v = store.vertex(src);
            let begin = v.begin() as usize;
            let end = v.end() as usize;
            let hit = self.binary_search(dest, begin + 1, end, false);
            let s = store.slot(hit.index);
            std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
            let stable = store.leaf_lock(store.geo.leaf_id(hit.index)).version()
                == hit.leaf_version
                && v.begin() as usize == begin
                && v.end() as usize == end;
            if stable {
                let this = !s.is_empty() && !s.is_sentinel() && s.dest == dest;
                if prev == Some(this) {
                    verdict = Some(this);
                    break;
                }
                prev = Some(this);
            } else {
                prev = None;
            }
        }
        let found = verdict.unwrap_or_else(|| self.has_edge_locked(src, dest));
        self.gate.unlock_shared();
        found
    }

    /// Membership check under the shared leaf locks of `src`'s range.
    fn has_edge_locked(&self, src: u32, dest: u32) -> bool {
        let store = self.store();
        let geo = store.geo;
        loop {
            let v = store.vertex(src);
            let begin = v.begin() as usize;
            let end = v.end() as usize;
            let first_leaf = geo.leaf_id(begin);
            let last_leaf = geo.leaf_id(end.max(begin));
            for leaf in first_leaf..=last_leaf {
                store.leaf_lock(leaf).lock_shared();
            }
            if v.begin() as usize != begin || v.end() as usize != end {
                for leaf in first_leaf..=last_leaf {
                    store.leaf_lock(leaf).unlock_shared();
                }
                continue;
            }
            let hit = self.binary_search(dest, begin + 1, end, false);
            let s = store.slot(hit.index);
            let found = !s.is_empty() && !s.is_sentinel() && s.dest == dest;
            for leaf in first_leaf..=last_leaf {
                store.leaf_lock(leaf).unlock_shared();
            }
            return found;
        }
    }

    /// Ordered destination ids of `src`'s outgoing edges.
    ///
    /// Snapshots under the shared leaf locks covering the vertex's range.
    /// Designed for quiescent or read-dominated phases; a concurrent
    /// mutation of `src` itself can move the range mid-snapshot.
    pub fn neighbors(&self, src: u32) -> Vec<u32> {
        if (src as usize) >= self.vertex_count() {
            return Vec::new();
        }
        self.gate.lock_shared();
        let store = self.store();
        let geo = store.geo;
        let out = loop {
            let v = store.vertex(src);
            let begin = v.begin() as usize;
            let end = v.end() as usize;
            let first_leaf = geo.leaf_id(begin);
            let last_leaf = geo.leaf_id(end.max(begin));
            for leaf in first_leaf..=last_leaf {
                store.leaf_lock(leaf).lock_shared();
            }
            if v.begin() as usize != begin || v.end() as usize != end {
                for leaf in first_leaf..=last_leaf {
                    store.leaf_lock(leaf).unlock_shared();
                }
                continue;
            }
            let mut out = Vec::with_capacity(v.degree() as usize);
            for i in begin + 1..end {
                let s = store.slot(i);
                if !s.is_empty() {
                    out.push(s.dest);
                }
            }
            for leaf in first_leaf..=last_leaf {
                store.leaf_lock(leaf).unlock_shared();
            }
            break out;
        };
        self.gate.unlock_shared();
        out
    }

    /// Walks `src`'s neighborhood without materializing it; returns the
    /// number of edges seen. The pool's Read task uses this.
    pub fn scan_neighborhood(&self, src: u32) -> usize {
        if (src as usize) >= self.vertex_count() {
            return 0;
        }
        self.gate.lock_shared();
        let store = self.store();
        let v = store.vertex(src);
        let mut seen = 0usize;
        for i in v.begin() as usize + 1..v.end() as usize {
            seen += usize::from(!store.slot(i).is_empty());
        }
        self.gate.unlock_shared();
        seen
    }

    /// Calls `f(dest, weight)` for each of `src`'s edges, in order.
    ///
    /// Lock-free; callers run this on a quiescent store (analytics).
    pub fn for_each_edge(&self, src: u32, mut f: impl FnMut(u32, u32)) {
        if (src as usize) >= self.vertex_count() {
            return;
        }
        let store = self.store();
        let v = store.vertex(src);
        for i in v.begin() as usize + 1..v.end() as usize {
            let s = store.slot(i);
            if !s.is_empty() {
                f(s.dest, s.weight);
            }
        }
    }

    /// Appends a vertex (with its sentinel) at the end of the array.
    ///
    /// Takes the gate exclusively; must not race lock-free readers.
    pub fn add_vertex(&self) {
        self.gate.lock();
        let store = self.store();
        let vid = store.vertices.len() as u32;
        let begin = if vid == 0 {
            0
        } else {
            store.vertex(vid - 1).end() as usize
        };
        // SAFETY: exclusive gate held; the shared borrow above is dead once
        // the vertex table grows.
        unsafe {
            self.store_mut()
                .vertices
                .push(VertexRecord::new(begin as u32, begin as u32 + 1));
        }
        // The insert slides or doubles as needed and re-fixes the new
        // sentinel's bookkeeping at its final position.
        self.insert_at(begin, RawSlot::sentinel(vid), vid, None);
        self.gate.unlock();
    }
}

/// Validation surface: structural checks used by tests and debugging.
///
/// All of these walk the array without locks and expect a quiescent store.
impl PackedCsr {
    /// Whether every vertex's edges are strictly ascending by destination.
    pub fn is_sorted(&self) -> bool {
        let store = self.store();
        for v in 0..store.vertices.len() {
            let rec = &store.vertices[v];
            let mut prev: Option<u32> = None;
            for i in rec.begin() as usize + 1..rec.end() as usize {
                let s = store.slot(i);
                if s.is_empty() {
                    continue;
                }
                if let Some(p) = prev {
                    if s.dest <= p {
                        return false;
                    }
                }
                prev = Some(s.dest);
            }
        }
        true
    }

    /// Total number of stored edges.
    pub fn count_edges(&self) -> usize {
        let store = self.store();
        let mut total = 0;
        for rec in &store.vertices {
            for i in rec.begin() as usize + 1..rec.end() as usize {
                total += usize::from(!store.slot(i).is_empty());
            }
        }
        total
    }

    /// All stored edges as `(src, dest, weight)`.
    pub fn edges(&self) -> Vec<(u32, u32, u32)> {
        let store = self.store();
        let mut out = Vec::new();
        for (v, rec) in store.vertices.iter().enumerate() {
            for i in rec.begin() as usize + 1..rec.end() as usize {
                let s = store.slot(i);
                if !s.is_empty() {
                    out.push((v as u32, s.dest, s.weight));
                }
            }
        }
        out
    }

    /// Whether sentinel bookkeeping is intact: one sentinel per vertex, at
    /// `begin`, with `end` chaining to the next vertex and the last vertex
    /// running to the second-to-last slot.
    pub fn sentinels_consistent(&self) -> bool {
        let store = self.store();
        let count = store.vertices.len();
        let mut sentinels = 0usize;
        for i in 0..store.geo.n {
            let s = store.slot(i);
            if !s.is_empty() && s.is_sentinel() {
                sentinels += 1;
            }
        }
        if sentinels != count {
            return false;
        }
        for v in 0..count {
            let rec = &store.vertices[v];
            let s = store.slot(rec.begin() as usize);
            if s.is_empty() || !s.is_sentinel() || s.sentinel_owner() != v as u32 {
                return false;
            }
            let expected_end = if v + 1 < count {
                store.vertices[v + 1].begin()
            } else {
                store.geo.n as u32 - 1
            };
            if rec.end() != expected_end {
                return false;
            }
        }
        true
    }

    /// Whether every vertex's `degree` matches a recount of its range.
    pub fn degrees_consistent(&self) -> bool {
        let store = self.store();
        for rec in &store.vertices {
            let mut count = 0u32;
            for i in rec.begin() as usize + 1..rec.end() as usize {
                count += u32::from(!store.slot(i).is_empty());
            }
            if rec.degree() != count {
                return false;
            }
        }
        true
    }

    /// Whether every aligned range at every level respects its density
    /// window. Holds on uniform states (construction, right after a
    /// resize); the level-local rebalance walk allows transient excursions
    /// in between.
    pub fn density_within_bounds(&self) -> bool {
        let store = self.store();
        let geo = store.geo;
        let mut len = geo.log_n;
        while len <= geo.n {
            let bounds = geo.bounds(geo.depth_of(len));
            let mut index = 0;
            while index < geo.n {
                let d = store.density(index, len);
                if d < bounds.lower || d > bounds.upper {
                    return false;
                }
                index += len;
            }
            len *= 2;
        }
        true
    }

    /// Whether every leaf lock and the gate could be taken exclusively
    /// right now. Detects leaked locks after an operation.
    pub fn locks_quiescent(&self) -> bool {
        let store = self.store();
        store.leaf_locks.iter().all(|l| l.is_lockable()) && self.gate.is_lockable()
    }

    /// Approximate memory footprint of the partition.
    pub fn footprint_bytes(&self) -> usize {
        let store = self.store();
        store.slots.len() * std::mem::size_of::<SlotCell>()
            + store.vertices.capacity() * std::mem::size_of::<VertexRecord>()
            + store.leaf_locks.len() * std::mem::size_of::<CachePadded<HybridLock>>()
    }
}
