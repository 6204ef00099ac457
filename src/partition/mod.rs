//! Vertex-range partitioning over multiple packed arrays.
//!
//! [`PartitionedCsr`] splits vertices `0..N` into `D × P` contiguous ranges
//! (`D` NUMA domains, `P` partitions per domain), one [`PackedCsr`] each.
//! Requests route by *source* vertex only; destinations are opaque global
//! ids stored as-is, so cross-partition edges cost nothing. With NUMA
//! enabled, each partition is built by a thread pinned to its domain so
//! first-touch allocation places the arrays locally.

use crate::numa::{self, Topology};
use crate::pma::{PackedCsr, SearchMode};

/// Construction options for a partitioned store.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// How mutations search for their target index.
    pub search_mode: SearchMode,
    /// Partitions carved out of each NUMA domain.
    pub partitions_per_domain: usize,
    /// Pin partition memory and workers to their domain.
    pub numa: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::Locked,
            partitions_per_domain: 1,
            numa: false,
        }
    }
}

/// A graph store partitioned across independent packed memory arrays.
pub struct PartitionedCsr {
    partitions: Vec<PackedCsr>,
    /// First global vertex id of each partition.
    distribution: Vec<u32>,
    partitions_per_domain: usize,
}

impl PartitionedCsr {
    /// Creates a store for `vertex_count` vertices split across
    /// `domains × options.partitions_per_domain` partitions.
    pub fn new(vertex_count: u32, domains: usize, options: &StoreOptions) -> Self {
        let ppd = options.partitions_per_domain.max(1);
        let total = domains.max(1) * ppd;
        let chunk = (vertex_count as usize).div_ceil(total).max(1);

        let mut distribution = Vec::with_capacity(total);
        let mut sizes = Vec::with_capacity(total);
        for p in 0..total {
            let start = (p * chunk).min(vertex_count as usize) as u32;
            let end = if p == total - 1 {
                vertex_count
            } else {
                ((p + 1) * chunk).min(vertex_count as usize) as u32
            };
            distribution.push(start);
            sizes.push(end - start);
        }

        let search_mode = options.search_mode;
        let partitions: Vec<PackedCsr> = if options.numa {
            let topology = Topology::detect();
            std::thread::scope(|s| {
                let handles: Vec<_> = sizes
                    .iter()
                    .enumerate()
                    .map(|(p, &local)| {
                        let topology = &topology;
                        s.spawn(move || {
                            let domain = p / ppd;
                            // First-touch: build on the domain that owns it.
                            numa::pin_current_thread(topology, domain);
                            PackedCsr::new(local, search_mode, domain)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("partition construction panicked"))
                    .collect()
            })
        } else {
            sizes
                .iter()
                .enumerate()
                .map(|(p, &local)| PackedCsr::new(local, search_mode, p / ppd))
                .collect()
        };

        Self {
            partitions,
            distribution,
            partitions_per_domain: ppd,
        }
    }

    /// The partition owning global vertex `v` (the last one for ids past
    /// the configured range, which then no-op at the partition level).
    pub fn partition_of(&self, v: u32) -> usize {
        for p in 1..self.distribution.len() {
            if self.distribution[p] > v {
                return p - 1;
            }
        }
        self.distribution.len() - 1
    }

    #[inline]
    fn route(&self, v: u32) -> (&PackedCsr, u32) {
        let p = self.partition_of(v);
        (&self.partitions[p], v - self.distribution[p])
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// NUMA domain of partition `p`.
    pub fn domain_of(&self, p: usize) -> usize {
        p / self.partitions_per_domain
    }

    /// Direct access to partition `p` (validation and registration).
    pub fn partition(&self, p: usize) -> &PackedCsr {
        &self.partitions[p]
    }

    /// Total vertex count across partitions.
    pub fn vertex_count(&self) -> usize {
        self.partitions.iter().map(PackedCsr::vertex_count).sum()
    }

    /// Inserts edge `(src, dest)`; see [`PackedCsr::add_edge`].
    pub fn add_edge(&self, src: u32, dest: u32, weight: u32) {
        let (part, local) = self.route(src);
        part.add_edge(local, dest, weight);
    }

    /// Removes edge `(src, dest)`; see [`PackedCsr::remove_edge`].
    pub fn remove_edge(&self, src: u32, dest: u32) {
        let (part, local) = self.route(src);
        part.remove_edge(local, dest);
    }

    /// Whether edge `(src, dest)` exists.
    pub fn has_edge(&self, src: u32, dest: u32) -> bool {
        let (part, local) = self.route(src);
        part.has_edge(local, dest)
    }

    /// Ordered destinations of `src`'s outgoing edges.
    pub fn neighbors(&self, src: u32) -> Vec<u32> {
        let (part, local) = self.route(src);
        part.neighbors(local)
    }

    /// Walks `src`'s neighborhood; returns the edge count seen.
    pub fn scan_neighborhood(&self, src: u32) -> usize {
        let (part, local) = self.route(src);
        part.scan_neighborhood(local)
    }

    /// Current neighbor count of `src` (zero when out of range).
    pub fn degree(&self, src: u32) -> usize {
        let (part, local) = self.route(src);
        if (local as usize) < part.vertex_count() {
            part.degree(local)
        } else {
            0
        }
    }

    /// Calls `f(dest, weight)` for each edge of `src`, in order.
    pub fn for_each_edge(&self, src: u32, f: impl FnMut(u32, u32)) {
        let (part, local) = self.route(src);
        part.for_each_edge(local, f);
    }

    /// Appends a vertex to the last partition.
    pub fn add_vertex(&self) {
        self.partitions
            .last()
            .expect("store has at least one partition")
            .add_vertex();
    }

    /// Registers the calling worker on partition `p`'s gate.
    pub fn register_thread(&self, p: usize) {
        self.partitions[p].gate().register_thread();
    }

    /// Unregisters the calling worker from partition `p`'s gate.
    pub fn unregister_thread(&self, p: usize) {
        self.partitions[p].gate().unregister_thread();
    }

    /// Whether every partition's locks are quiescent.
    pub fn locks_quiescent(&self) -> bool {
        self.partitions.iter().all(PackedCsr::locks_quiescent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_covers_the_whole_range() {
        let store = PartitionedCsr::new(
            10,
            2,
            &StoreOptions {
                partitions_per_domain: 2,
                ..StoreOptions::default()
            },
        );
        assert_eq!(store.partition_count(), 4);
        assert_eq!(store.vertex_count(), 10);
        for v in 0..10 {
            let p = store.partition_of(v);
            assert!(p < 4, "vertex {v} routed to {p}");
        }
        // 10 vertices over 4 partitions: 3, 3, 3, 1.
        assert_eq!(store.partition(0).vertex_count(), 3);
        assert_eq!(store.partition(3).vertex_count(), 1);
        assert_eq!(store.domain_of(0), 0);
        assert_eq!(store.domain_of(3), 1);
    }

    #[test]
    fn tiny_ranges_leave_trailing_partitions_empty() {
        let store = PartitionedCsr::new(
            2,
            4,
            &StoreOptions::default(),
        );
        assert_eq!(store.partition_count(), 4);
        assert_eq!(store.vertex_count(), 2);
        store.add_edge(1, 0, 9);
        assert!(store.has_edge(1, 0));
        assert!(!store.has_edge(0, 1));
    }

    #[test]
    fn cross_partition_destinations_are_opaque() {
        let store = PartitionedCsr::new(
            8,
            2,
            &StoreOptions {
                partitions_per_domain: 2,
                ..StoreOptions::default()
            },
        );
        store.add_edge(0, 7, 1);
        store.add_edge(7, 0, 1);
        assert!(store.has_edge(0, 7));
        assert!(store.has_edge(7, 0));
        assert_eq!(store.neighbors(0), vec![7]);
        assert_eq!(store.neighbors(7), vec![0]);
    }
}
