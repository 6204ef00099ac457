//! Binary search over a vertex's slot range.
//!
//! The range is sparse, so when the midpoint is empty the probe scans
//! outward (right, then left, widening by one each round) until it finds a
//! non-empty slot or exhausts the range. Alongside the index, the search
//! returns the version of the leaf it landed in; lock acquisition compares
//! it later to detect that the leaf changed in between.

use super::PackedCsr;

/// Result of a range search: target index plus the observed leaf version.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SearchHit {
    pub index: usize,
    pub leaf_version: u64,
}

impl PackedCsr {
    /// Finds where an edge to `dest` lives in `[start, end)`, or where it
    /// would be inserted (`end` meaning "after everything here").
    ///
    /// `start`/`end` must exclude the vertex's own sentinel. With
    /// `unlock_shared_after`, the shared leaf locks covering the *initial*
    /// range are released before returning (locked-search mode).
    pub(crate) fn binary_search(
        &self,
        dest: u32,
        mut start: usize,
        mut end: usize,
        unlock_shared_after: bool,
    ) -> SearchHit {
        let store = self.store();
        let geo = store.geo;
        let first_leaf = geo.leaf_id(start);
        let last_leaf = geo.leaf_id(end);
        let release = |do_it: bool| {
            if do_it {
                for leaf in first_leaf..=last_leaf {
                    store.leaf_lock(leaf).unlock_shared();
                }
            }
        };

        while start + 1 < end {
            let mid = (start + end) / 2;
            let mut item = store.slot(mid);
            let mut check = mid;
            let mut change = 1usize;

            // Outward probe for a non-empty slot.
            let mut keep_probing = true;
            while item.is_empty() && keep_probing {
                keep_probing = false;
                let right = mid + change;
                if right < end {
                    keep_probing = true;
                    check = right;
                    item = store.slot(right);
                    if !item.is_empty() {
                        break;
                    }
                }
                if let Some(left) = mid.checked_sub(change) {
                    if left >= start {
                        keep_probing = true;
                        check = left;
                        item = store.slot(left);
                    }
                }
                change += 1;
            }

            // Versions are read while the shared locks (if any) are still
            // held, so the caller's later comparison spans every mutation
            // since the probed state.
            if item.is_empty() || check == start || check == end {
                if !item.is_empty() && check == start && dest <= item.dest {
                    let version = store.leaf_lock(geo.leaf_id(check)).version();
                    release(unlock_shared_after);
                    return SearchHit {
                        index: check,
                        leaf_version: version,
                    };
                }
                let version = store.leaf_lock(geo.leaf_id(mid)).version();
                release(unlock_shared_after);
                return SearchHit {
                    index: mid,
                    leaf_version: version,
                };
            }

            if item.dest == dest {
                let version = store.leaf_lock(geo.leaf_id(check)).version();
                release(unlock_shared_after);
                return SearchHit {
                    index: check,
                    leaf_version: version,
                };
            } else if dest < item.dest {
                end = check;
            } else {
                start = check;
            }
        }

        if end < start {
            start = end;
        }
        // One slot left: before it if less-or-equal, after it otherwise.
        let last = store.slot(start);
        if !last.is_empty() && dest <= last.dest {
            let version = store.leaf_lock(geo.leaf_id(start)).version();
            release(unlock_shared_after);
            return SearchHit {
                index: start,
                leaf_version: version,
            };
        }
        let version = store.leaf_lock(geo.leaf_id(end)).version();
        release(unlock_shared_after);
        SearchHit {
            index: end,
            leaf_version: version,
        }
    }
}
