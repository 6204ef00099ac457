//! Multi-leaf lock acquisition for mutations.
//!
//! A mutation must exclusively lock every leaf its slide + redistribute
//! will touch, and nothing else. The planner simulates both walks while
//! acquiring leaves strictly in ascending order. Whenever the needed range
//! turns out to extend *left* of what is already held, it drops everything
//! and restarts from the new leftmost leaf; that ordering discipline is
//! the deadlock-avoidance rule. Restarts are bounded; exhausting them (or
//! discovering the whole array must resize) escalates to the exclusive
//! gate, which always succeeds.

use super::slot::RawSlot;
use super::{PackedCsr, SearchMode};

/// Restarts the planner allows itself before escalating.
const MAX_PLAN_TRIES: u32 = 3;

/// Redistribution decisions the insert can reuse instead of re-walking the
/// density tree under its locks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InsertPlan {
    /// Start of the range to redistribute over.
    pub leaf_start: usize,
    /// Length of that range.
    pub max_len: usize,
    /// The walk hit the root: double instead of redistributing.
    pub double_list: bool,
}

/// Outcome of insert lock planning.
pub(crate) enum InsertLockOutcome {
    /// State changed since the search; roll back and retry.
    Retry,
    /// Take the gate exclusively (plan carries `double_list` when the
    /// density walk already proved a resize is needed).
    GlobalWrite(Option<InsertPlan>),
    /// Leaves `[first, last]` are locked exclusively; proceed.
    Locked {
        first: usize,
        last: usize,
        plan: InsertPlan,
    },
}

/// Outcome of remove lock planning.
pub(crate) enum RemoveLockOutcome {
    /// State changed since the search; roll back and retry.
    Retry,
    /// The edge is not present; terminal no-op.
    NotFound,
    /// Take the gate exclusively (the array wants to shrink).
    GlobalWrite,
    /// Leaves `[first, last]` are locked exclusively; proceed.
    Locked { first: usize, last: usize },
}

impl PackedCsr {
    /// Locks the leaves an insert at `index` will touch.
    ///
    /// `observed_version` is the version of `index`'s leaf recorded during
    /// the search; `left_bound` restarts acquisition from an earlier leaf
    /// after a leftward extension.
    pub(crate) fn plan_insert_locks(
        &self,
        index: usize,
        elem: RawSlot,
        src: u32,
        observed_version: u64,
        left_bound: Option<usize>,
        tries: u32,
    ) -> InsertLockOutcome {
        if tries > MAX_PLAN_TRIES {
            return InsertLockOutcome::GlobalWrite(None);
        }
        let store = self.store();
        let geo = store.geo;
        let mut node_index = geo.leaf_start(index);
        let mut level = geo.h;
        let mut len = geo.log_n;
        let leaf = geo.leaf_id(node_index);
        let mut min_leaf = leaf;
        let mut max_leaf = leaf;

        match left_bound {
            Some(lb) => {
                for l in lb..=leaf {
                    store.leaf_lock(l).lock();
                }
                min_leaf = min_leaf.min(lb);
            }
            None => {
                // The left neighbor is needed to validate the left-sentinel
                // side of an optimistic search result.
                if leaf > 0 && self.search_mode == SearchMode::Optimistic {
                    store.leaf_lock(leaf - 1).lock();
                    min_leaf = leaf - 1;
                }
                store.leaf_lock(leaf).lock();
            }
        }

        if store.leaf_lock(leaf).version() != observed_version {
            self.release_leaves_no_bump(min_leaf, max_leaf);
            return InsertLockOutcome::Retry;
        }
        if index == geo.n - 1 && !store.slot(index).is_empty() {
            self.release_leaves_no_bump(min_leaf, max_leaf);
            return InsertLockOutcome::GlobalWrite(None);
        }
        if self.search_mode == SearchMode::Optimistic {
            // The unlocked search may have returned a stale index.
            let current = store.slot(index);
            if !self.insertion_index_correct(current, src, index, elem.dest, node_index, &mut max_leaf)
            {
                self.release_leaves_no_bump(min_leaf, max_leaf);
                return InsertLockOutcome::Retry;
            }
        }

        // A leaf that fills completely spills into its parent right away.
        if store.occupancy(node_index, len) + 1 == len {
            let new_node_index = geo.range_start(node_index, 2 * len);
            let new_leaf = geo.leaf_id(new_node_index);
            if new_leaf < min_leaf {
                self.release_leaves_no_bump(min_leaf, max_leaf);
                return self.plan_insert_locks(
                    index,
                    elem,
                    src,
                    observed_version,
                    Some(new_leaf),
                    tries + 1,
                );
            }
            node_index = new_node_index;
        }

        // Simulate the density walk, acquiring as the range grows right and
        // restarting when it grows left.
        let mut bounds = geo.bounds(level);
        let mut density = store.density(node_index, len) + 1.0 / len as f64;
        while density >= bounds.upper {
            len *= 2;
            if len <= geo.n {
                level -= 1;
                let new_node_index = geo.range_start(node_index, len);
                if new_node_index < node_index {
                    let new_leaf = geo.leaf_id(new_node_index);
                    if new_leaf < min_leaf {
                        self.release_leaves_no_bump(min_leaf, max_leaf);
                        return self.plan_insert_locks(
                            index,
                            elem,
                            src,
                            observed_version,
                            Some(new_leaf),
                            tries + 1,
                        );
                    }
                    node_index = new_node_index;
                } else {
                    let end_leaf = geo.leaf_id(new_node_index + len);
                    node_index = new_node_index;
                    for l in max_leaf + 1..end_leaf {
                        store.leaf_lock(l).lock();
                        max_leaf = l;
                    }
                }
                bounds = geo.bounds(level);
                density = store.density(node_index, len) + 1.0 / len as f64;
            } else {
                self.release_leaves_no_bump(min_leaf, max_leaf);
                return InsertLockOutcome::GlobalWrite(Some(InsertPlan {
                    leaf_start: 0,
                    max_len: 0,
                    double_list: true,
                }));
            }
        }

        // Align to the final range and cover any remainder on the right.
        let new_node_index = geo.range_start(node_index, len);
        if new_node_index < node_index {
            let new_leaf = geo.leaf_id(new_node_index);
            if new_leaf < min_leaf {
                self.release_leaves_no_bump(min_leaf, max_leaf);
                return self.plan_insert_locks(
                    index,
                    elem,
                    src,
                    observed_version,
                    Some(new_leaf),
                    tries + 1,
                );
            }
            min_leaf = min_leaf.min(new_leaf);
        } else {
            let end_leaf = geo.leaf_id(new_node_index + len);
            for l in max_leaf + 1..end_leaf {
                store.leaf_lock(l).lock();
                max_leaf = l;
            }
        }
        let plan = InsertPlan {
            leaf_start: new_node_index,
            max_len: len,
            double_list: false,
        };

        // Simulate the slide: every slot the displaced run covers, plus the
        // empty slot that stops it, must be locked.
        let len = geo.log_n;
        let node_index = geo.leaf_start(index);
        if !store.slot(index).is_empty() {
            let mut curr_leaf = geo.leaf_id(node_index);
            let mut curr_leaf_start = node_index;
            let mut curr_ind = index + 1;
            if curr_ind < geo.n && curr_ind >= curr_leaf_start + len {
                curr_leaf_start = curr_ind;
                curr_leaf += 1;
                if curr_leaf > max_leaf {
                    store.leaf_lock(curr_leaf).lock();
                    max_leaf = curr_leaf;
                }
            }
            while curr_ind < geo.n && !store.slot(curr_ind).is_empty() {
                curr_ind += 1;
                if curr_ind < geo.n && curr_ind >= curr_leaf_start + len {
                    curr_leaf += 1;
                    if curr_leaf > max_leaf {
                        store.leaf_lock(curr_leaf).lock();
                        max_leaf = curr_leaf;
                    }
                    curr_leaf_start = curr_ind;
                }
            }
            if curr_ind == geo.n {
                // The run reaches the array end; the insert will slide left
                // instead. Walk left to the stopping slot.
                let mut ind = index as i64;
                let mut leaf_start_i = node_index as i64;
                let mut leaf_i = geo.leaf_id(node_index);
                while ind >= 0 && !store.slot(ind as usize).is_empty() {
                    ind -= 1;
                    if ind >= 0 && ind < leaf_start_i {
                        leaf_start_i = geo.leaf_start(ind as usize) as i64;
                        leaf_i -= 1;
                        if leaf_i < min_leaf {
                            self.release_leaves_no_bump(min_leaf, max_leaf);
                            return self.plan_insert_locks(
                                index,
                                elem,
                                src,
                                observed_version,
                                Some(leaf_i),
                                tries + 1,
                            );
                        }
                    }
                }
                if ind < 0 {
                    self.release_leaves_no_bump(min_leaf, max_leaf);
                    return InsertLockOutcome::GlobalWrite(None);
                }
            }
        }

        InsertLockOutcome::Locked {
            first: min_leaf,
            last: max_leaf,
            plan,
        }
    }

    /// Locks the leaves a removal at `index` will touch.
    pub(crate) fn plan_remove_locks(
        &self,
        index: usize,
        dest: u32,
        src: u32,
        observed_version: u64,
        left_bound: Option<usize>,
        tries: u32,
    ) -> RemoveLockOutcome {
        if tries > MAX_PLAN_TRIES {
            return RemoveLockOutcome::GlobalWrite;
        }
        let store = self.store();
        let geo = store.geo;
        let mut node_index = geo.leaf_start(index);
        let mut level = geo.h;
        let mut len = geo.log_n;
        let leaf = geo.leaf_id(node_index);
        let mut min_leaf = leaf;
        let mut max_leaf = leaf;

        match left_bound {
            Some(lb) => {
                for l in lb..=leaf {
                    store.leaf_lock(l).lock();
                }
                min_leaf = lb;
            }
            None => {
                store.leaf_lock(leaf).lock();
            }
        }

        let current = store.slot(index);
        if !self.insertion_index_correct(current, src, index, dest, node_index, &mut max_leaf) {
            self.release_leaves_no_bump(min_leaf, max_leaf);
            return RemoveLockOutcome::Retry;
        }
        if store.leaf_lock(leaf).version() != observed_version {
            self.release_leaves_no_bump(min_leaf, max_leaf);
            return RemoveLockOutcome::Retry;
        }
        if current.is_empty() || dest == u32::MAX || current.dest != dest {
            self.release_leaves_no_bump(min_leaf, max_leaf);
            return RemoveLockOutcome::NotFound;
        }

        // Downward density walk: cover every leaf of the range that will be
        // redistributed after the slot empties.
        let mut bounds = geo.bounds(level);
        let mut density = store.density(node_index, len) - 1.0 / len as f64;
        while density < bounds.lower {
            len *= 2;
            if len <= geo.n {
                level -= 1;
                let new_node_index = geo.range_start(node_index, len);
                let new_leaf = geo.leaf_id(new_node_index);
                if new_node_index < node_index && new_leaf < min_leaf {
                    self.release_leaves_no_bump(min_leaf, max_leaf);
                    return self.plan_remove_locks(
                        index,
                        dest,
                        src,
                        observed_version,
                        Some(new_leaf),
                        tries + 1,
                    );
                }
                let end_leaf = geo.leaf_id(new_node_index + len);
                for l in max_leaf + 1..end_leaf {
                    store.leaf_lock(l).lock();
                    max_leaf = l;
                }
                node_index = new_node_index;
                bounds = geo.bounds(level);
                density = store.density(node_index, len) - 1.0 / len as f64;
            } else {
                self.release_leaves_no_bump(min_leaf, max_leaf);
                return RemoveLockOutcome::GlobalWrite;
            }
        }

        let new_node_index = geo.range_start(node_index, len);
        let new_leaf = geo.leaf_id(new_node_index);
        if new_node_index < node_index && new_leaf < min_leaf {
            self.release_leaves_no_bump(min_leaf, max_leaf);
            return self.plan_remove_locks(
                index,
                dest,
                src,
                observed_version,
                Some(new_leaf),
                tries + 1,
            );
        }
        let end_leaf = geo.leaf_id(new_node_index + len);
        for l in max_leaf + 1..end_leaf {
            store.leaf_lock(l).lock();
            max_leaf = l;
        }

        RemoveLockOutcome::Locked {
            first: min_leaf,
            last: max_leaf,
        }
    }

    /// Whether `index` is (still) the right place for an edge of `src`
    /// pointing at `dest`.
    ///
    /// `current` is the slot at `index` as read under the lock. Probing to
    /// the right may cross leaf boundaries; those leaves are locked on the
    /// way and reported back through `max_leaf`.
    pub(crate) fn insertion_index_correct(
        &self,
        current: RawSlot,
        src: u32,
        index: usize,
        dest: u32,
        leaf_start: usize,
        max_leaf: &mut usize,
    ) -> bool {
        let store = self.store();
        let geo = store.geo;
        let last_vertex = (store.vertices.len() - 1) as u32;

        // The occupant must belong to src's neighborhood: one of src's own
        // edges, or the next vertex's sentinel.
        if !current.is_empty() {
            if current.is_sentinel() {
                if src != last_vertex && current.src != src + 1 {
                    return false;
                }
                if src == last_vertex && current.weight != u32::MAX {
                    return false;
                }
            } else if current.src != src {
                return false;
            }
            if !current.is_sentinel() && current.dest < dest {
                return false;
            }
        }

        if current.is_empty() {
            // Empty target: the next element to the right must still be
            // larger (or the next vertex's sentinel).
            let mut ind = index + 1;
            let mut curr_leaf_start = leaf_start;
            if ind < geo.n && ind >= curr_leaf_start + geo.log_n {
                curr_leaf_start += geo.log_n;
                *max_leaf += 1;
                store.leaf_lock(*max_leaf).lock();
            }
            while ind < geo.n && store.slot(ind).is_empty() {
                ind += 1;
                if ind < geo.n && ind >= curr_leaf_start + geo.log_n {
                    curr_leaf_start += geo.log_n;
                    *max_leaf += 1;
                    store.leaf_lock(*max_leaf).lock();
                }
            }
            if ind < geo.n {
                let item = store.slot(ind);
                if !item.is_empty() && !item.is_sentinel() && item.src == src && item.dest < dest {
                    return false;
                }
                if !item.is_empty()
                    && item.is_sentinel()
                    && ((src != last_vertex && item.weight != src + 1)
                        || (src == last_vertex && item.weight == u32::MAX))
                {
                    return false;
                }
            }
        }

        // The nearest element on the left must be an earlier edge of src,
        // or src's own sentinel.
        let mut ind = index as i64 - 1;
        while ind >= 0 && store.slot(ind as usize).is_empty() {
            ind -= 1;
        }
        if ind >= 0 {
            let item = store.slot(ind as usize);
            if !item.is_empty() && !item.is_sentinel() && item.src == src && item.dest >= dest {
                return false;
            }
            if !item.is_empty()
                && item.is_sentinel()
                && ((src == 0 && item.weight != u32::MAX) || (src != 0 && item.weight != src))
            {
                return false;
            }
        }
        true
    }
}
