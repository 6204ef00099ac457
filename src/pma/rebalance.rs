//! Structural maintenance: slides, redistribution, resizes, and the
//! insert/remove engines that drive them.
//!
//! Callers hold either the exclusive gate, or the shared gate plus the
//! exclusive locks of every leaf the planner returned; the planner's
//! simulation guarantees the walks below never leave that leaf range.

use super::plan::InsertPlan;
use super::slot::{RawSlot, SlotCell};
use super::{geometry::Geometry, PackedCsr};
use crate::sync::HybridLock;
use crossbeam_utils::CachePadded;

impl PackedCsr {
    /// Repoints vertex bookkeeping at a sentinel's new position.
    pub(crate) fn fix_sentinel(&self, owner: u32, pos: usize) {
        let store = self.store();
        store.vertex(owner).set_begin(pos as u32);
        if owner > 0 {
            store.vertex(owner - 1).set_end(pos as u32);
        }
        if owner as usize == store.vertices.len() - 1 {
            store.vertex(owner).set_end(store.geo.n as u32 - 1);
        }
    }

    /// Evenly respreads the non-empty slots of `[index, index + len)`,
    /// fixing every sentinel that moves.
    pub(crate) fn redistribute(&self, index: usize, len: usize) {
        let store = self.store();
        let mut packed: Vec<RawSlot> = Vec::with_capacity(len);
        for i in index..index + len {
            let s = store.slot(i);
            if !s.is_empty() {
                packed.push(s);
            }
            store.clear_slot(i);
        }
        if packed.is_empty() {
            return;
        }
        let step = len as f64 / packed.len() as f64;
        let mut index_d = index as f64;
        for s in packed {
            let at = index_d as usize;
            store.set_slot(at, s);
            if s.is_sentinel() {
                self.fix_sentinel(s.sentinel_owner(), at);
            }
            index_d += step;
        }
    }

    /// Frees `index` by shifting the occupied run starting there one slot
    /// to the right. Returns `false` (untouched) if the run reaches the
    /// array end.
    pub(crate) fn slide_right(&self, index: usize) -> bool {
        let store = self.store();
        if store.slot(index).is_empty() {
            return true;
        }
        let n = store.geo.n;
        let mut stop = None;
        for i in index + 1..n {
            if store.slot(i).is_empty() {
                stop = Some(i);
                break;
            }
        }
        let Some(stop) = stop else {
            return false;
        };
        for i in (index..stop).rev() {
            let s = store.slot(i);
            store.set_slot(i + 1, s);
            if s.is_sentinel() {
                self.fix_sentinel(s.sentinel_owner(), i + 1);
            }
        }
        store.clear_slot(index);
        true
    }

    /// Frees `index` by shifting the occupied run ending there one slot to
    /// the left. Returns `false` (untouched) if no empty slot exists on the
    /// left.
    pub(crate) fn slide_left(&self, index: usize) -> bool {
        let store = self.store();
        if store.slot(index).is_empty() {
            return true;
        }
        let mut stop = None;
        for i in (0..index).rev() {
            if store.slot(i).is_empty() {
                stop = Some(i);
                break;
            }
        }
        let Some(stop) = stop else {
            return false;
        };
        for i in stop + 1..=index {
            let s = store.slot(i);
            store.set_slot(i - 1, s);
            if s.is_sentinel() {
                self.fix_sentinel(s.sentinel_owner(), i - 1);
            }
        }
        store.clear_slot(index);
        true
    }

    /// Doubles the array: copy, extend the leaf lock table, respread.
    ///
    /// Caller must hold the gate exclusively.
    pub(crate) fn double_list(&self) {
        // SAFETY: exclusive gate held; no other reference into the store.
        let store = unsafe { self.store_mut() };
        let old_n = store.geo.n;
        let new_geo = Geometry::with_slots(old_n * 2);
        tracing::debug!(old_n, new_n = new_geo.n, "doubling edge array");

        let mut new_slots: Vec<SlotCell> = Vec::with_capacity(new_geo.n);
        for cell in &store.slots {
            let fresh = SlotCell::new_empty();
            fresh.store(cell.load());
            new_slots.push(fresh);
        }
        new_slots.extend((old_n..new_geo.n).map(|_| SlotCell::new_empty()));
        store.slots = new_slots;
        store.geo = new_geo;
        while store.leaf_locks.len() < new_geo.leaf_count() {
            store.leaf_locks.push(CachePadded::new(HybridLock::new()));
        }

        self.redistribute(0, new_geo.n);
    }

    /// Halves the array: compact left, drop surplus leaf locks, respread.
    ///
    /// Caller must hold the gate exclusively.
    pub(crate) fn halve_list(&self) {
        // SAFETY: exclusive gate held; no other reference into the store.
        let store = unsafe { self.store_mut() };
        let old_n = store.geo.n;
        if old_n <= 4 {
            return;
        }
        let new_geo = Geometry::with_slots(old_n / 2);
        tracing::debug!(old_n, new_n = new_geo.n, "halving edge array");

        let new_slots: Vec<SlotCell> = (0..new_geo.n).map(|_| SlotCell::new_empty()).collect();
        let mut packed = 0usize;
        for cell in &store.slots {
            let s = cell.load();
            if !s.is_empty() {
                new_slots[packed].store(s);
                packed += 1;
            }
        }
        debug_assert!(packed <= new_geo.n);
        store.slots = new_slots;
        store.geo = new_geo;
        store.leaf_locks.truncate(new_geo.leaf_count());

        self.redistribute(0, new_geo.n);
    }

    /// Places `elem` at `index` (sliding to make room), then rebalances the
    /// smallest enclosing range that stays within its density bound.
    ///
    /// Returns `true` when an existing edge was overwritten instead of
    /// inserted (the caller rolls back its degree bump).
    pub(crate) fn insert_at(
        &self,
        index: usize,
        elem: RawSlot,
        src: u32,
        plan: Option<&InsertPlan>,
    ) -> bool {
        let store = self.store();
        let geo = store.geo;
        let mut index = index;

        let current = store.slot(index);
        if !current.is_empty() {
            if !elem.is_sentinel() && current.dest == elem.dest {
                store.set_slot(index, elem);
                return true;
            }
            if index == geo.n - 1 {
                // No room at the very end; grow and place via a fresh search.
                self.double_list();
                return self.insert_after_grow(elem, src);
            }
            if !self.slide_right(index) {
                index -= 1;
                if !self.slide_left(index) {
                    self.double_list();
                    return self.insert_after_grow(elem, src);
                }
            }
        }
        store.set_slot(index, elem);
        if elem.is_sentinel() {
            self.fix_sentinel(elem.sentinel_owner(), index);
        }

        let mut node_index = geo.leaf_start(index);
        let mut level = geo.h;
        let mut len = geo.log_n;

        // A completely full leaf spills straight into its parent.
        if store.occupancy(node_index, len) == len {
            if len * 2 <= geo.n {
                node_index = geo.range_start(node_index, len * 2);
                self.redistribute(node_index, len * 2);
            } else {
                self.double_list();
                return false;
            }
        } else {
            self.redistribute(node_index, len);
        }

        match plan {
            Some(p) if p.double_list => {
                self.double_list();
                return false;
            }
            Some(p) => {
                len = p.max_len;
                node_index = p.leaf_start;
            }
            None => {
                let mut bounds = geo.bounds(level);
                let mut density = store.density(node_index, len);
                while density >= bounds.upper {
                    len *= 2;
                    if len <= geo.n {
                        level -= 1;
                        node_index = geo.range_start(node_index, len);
                        bounds = geo.bounds(level);
                        density = store.density(node_index, len);
                    } else {
                        self.double_list();
                        return false;
                    }
                }
            }
        }
        if len > geo.log_n {
            self.redistribute(node_index, len);
        }
        false
    }

    /// Re-locates and places `elem` after a grow. Only reachable under the
    /// exclusive gate (the fine-grained path never resizes).
    fn insert_after_grow(&self, elem: RawSlot, src: u32) -> bool {
        let store = self.store();
        let index = if elem.is_sentinel() {
            if src == 0 {
                0
            } else {
                store.vertex(src - 1).end() as usize
            }
        } else {
            let v = store.vertex(src);
            self.binary_search(elem.dest, v.begin() as usize + 1, v.end() as usize, false)
                .index
        };
        self.insert_at(index, elem, src, None)
    }

    /// Empties `index` (which must hold an edge to `dest`), then rebalances
    /// downward, halving at the root.
    pub(crate) fn remove_at(&self, index: usize, dest: u32) {
        let store = self.store();
        let geo = store.geo;
        let current = store.slot(index);
        if current.is_empty() || dest == u32::MAX || current.dest != dest {
            return;
        }
        store.clear_slot(index);

        let mut node_index = geo.leaf_start(index);
        let mut level = geo.h;
        let mut len = geo.log_n;
        self.redistribute(node_index, len);

        let mut bounds = geo.bounds(level);
        let mut density = store.density(node_index, len);
        while density < bounds.lower {
            len *= 2;
            if len <= geo.n {
                level -= 1;
                node_index = geo.range_start(node_index, len);
                bounds = geo.bounds(level);
                density = store.density(node_index, len);
            } else {
                self.halve_list();
                return;
            }
        }
        self.redistribute(node_index, len);
    }
}
