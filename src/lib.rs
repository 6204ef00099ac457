//! # `strata` - Concurrent Packed-Memory Graph Store
//!
//! An in-memory mutable graph store tuned for concurrent mixed update/read
//! workloads. Edges live in *packed memory arrays*: sparse, sorted arrays
//! with density-bounded rebalancing, giving O(log² n) amortized updates
//! that move few elements.
//!
//! ## Key pieces
//!
//! - **Fine-grained concurrency**: per-leaf [`HybridLock`]s with version
//!   counters drive optimistic searches with bounded retries; a per-array
//!   [`ResizeGate`] turns the global shared acquisition into a no-op for
//!   registered workers.
//! - **NUMA-aware partitioning**: [`PartitionedCsr`] splits the vertex
//!   range across independent arrays pinned to their domains; mutations
//!   route by source vertex.
//! - **Batch execution**: [`ThreadPool`] spreads a bulk update stream over
//!   per-worker queues with work stealing.
//! - **Analytics**: BFS, PageRank, and SpMV demonstrators over the
//!   [`Adjacency`] seam, for quiescent phases.
//!
//! ## Example
//!
//! ```rust
//! use strata::{PartitionedCsr, StoreOptions};
//!
//! let store = PartitionedCsr::new(10, 1, &StoreOptions::default());
//! store.add_edge(0, 1, 1);
//! assert!(store.has_edge(0, 1));
//! assert_eq!(store.neighbors(0), vec![1]);
//! store.remove_edge(0, 1);
//! assert!(!store.has_edge(0, 1));
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod analytics;
pub mod input;
pub mod numa;
pub mod partition;
pub mod pma;
pub mod pool;
pub mod sync;

pub use analytics::{bfs, pagerank, spmv, Adjacency, UNREACHABLE};
pub use input::{read_updates, Op, ParseError, Update};
pub use partition::{PartitionedCsr, StoreOptions};
pub use pma::slot::{RawSlot, Slot};
pub use pma::{PackedCsr, SearchMode};
pub use pool::{RoutingMode, Task, ThreadPool};
pub use sync::{HybridLock, ResizeGate};

// Compile-time layout checks: the packed slot must stay three bare words.
const _: () = {
    use core::mem;

    assert!(mem::size_of::<RawSlot>() == 12);
    assert!(mem::size_of::<pma::slot::SlotCell>() == 12);
    assert!(mem::align_of::<pma::slot::SlotCell>() == 4);
};
