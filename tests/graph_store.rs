//! End-to-end scenarios over the partitioned store and single partitions.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use strata::{bfs, PackedCsr, PartitionedCsr, SearchMode, StoreOptions, UNREACHABLE};

fn options(search_mode: SearchMode) -> StoreOptions {
    StoreOptions {
        search_mode,
        partitions_per_domain: 1,
        numa: false,
    }
}

const MODES: [SearchMode; 2] = [SearchMode::Locked, SearchMode::Optimistic];

#[test]
fn initialization() {
    for mode in MODES {
        let store = PartitionedCsr::new(10, 1, &options(mode));
        assert_eq!(store.vertex_count(), 10);
    }
}

#[test]
fn add_vertex_from_empty() {
    for mode in MODES {
        let store = PartitionedCsr::new(0, 1, &options(mode));
        assert_eq!(store.vertex_count(), 0);
        store.add_vertex();
        assert_eq!(store.vertex_count(), 1);
        assert!(store.neighbors(0).is_empty());
    }
}

#[test]
fn add_edge_basics() {
    for mode in MODES {
        let store = PartitionedCsr::new(10, 1, &options(mode));
        // Out-of-range source: silent no-op.
        store.add_edge(11, 1, 1);

        store.add_edge(0, 1, 1);
        assert!(store.has_edge(0, 1));
        assert_eq!(store.neighbors(0), vec![1]);
        assert_eq!(store.vertex_count(), 10);
        assert!(store.neighbors(2).is_empty());
    }
}

#[test]
fn remove_edge_round_trip() {
    for mode in MODES {
        let store = PartitionedCsr::new(10, 1, &options(mode));
        store.add_vertex();
        store.remove_edge(0, 1); // absent: no-op
        assert!(!store.has_edge(0, 1));
        store.add_edge(0, 1, 1);
        assert!(store.has_edge(0, 1));
        assert_eq!(store.neighbors(0).len(), 1);
        store.remove_edge(0, 1);
        assert!(!store.has_edge(0, 1));
        assert!(store.neighbors(2).is_empty());
    }
}

#[test]
fn add_remove_1e4_sequential() {
    for mode in MODES {
        let graph = PackedCsr::new(10, mode, 0);
        const EDGES: u32 = 10_000;

        for i in 1..=EDGES {
            graph.add_edge(0, i, i);
            assert!(graph.has_edge(0, i), "missing edge 0->{i}");
            assert!(graph.locks_quiescent(), "lock leaked after add {i}");
        }
        assert_eq!(graph.vertex_count(), 10);
        assert_eq!(graph.degree(0), EDGES as usize);

        for i in 1..=EDGES {
            graph.remove_edge(0, i);
            assert!(!graph.has_edge(0, i), "edge 0->{i} survived removal");
            assert!(graph.locks_quiescent(), "lock leaked after remove {i}");
        }
        assert_eq!(graph.degree(0), 0);
        assert!(graph.neighbors(0).is_empty());
        assert_eq!(graph.vertex_count(), 10);
    }
}

#[test]
fn random_mix_2e5_parallel() {
    for mode in MODES {
        let graph = PackedCsr::new(1000, mode, 0);
        const THREADS: u32 = 4;
        const OPS_PER_THREAD: u32 = 50_000;
        const SRC_STRIDE: u32 = 1000 / THREADS;

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let graph = &graph;
                s.spawn(move || {
                    graph.gate().register_thread();
                    // Disjoint source ranges keep the same-thread
                    // linearizability probes conflict-free.
                    let mut rng = SmallRng::seed_from_u64(0xC0FFEE + u64::from(t));
                    for i in 1..=OPS_PER_THREAD {
                        let src = t * SRC_STRIDE + rng.gen_range(0..SRC_STRIDE);
                        let dest = rng.gen_range(0..1000);
                        if rng.gen_range(0..4) != 0 {
                            graph.add_edge(src, dest, i);
                            assert!(graph.has_edge(src, dest), "add {src}->{dest} lost");
                        } else {
                            graph.remove_edge(src, dest);
                            assert!(!graph.has_edge(src, dest), "remove {src}->{dest} lost");
                        }
                    }
                    graph.gate().unregister_thread();
                });
            }
        });

        assert!(graph.locks_quiescent());
        assert!(graph.is_sorted());
        assert!(graph.sentinels_consistent());
        assert!(graph.degrees_consistent());
    }
}

#[test]
fn bfs_over_5e4_random_edges() {
    let graph = PackedCsr::new(1000, SearchMode::Locked, 0);
    let mut rng = SmallRng::seed_from_u64(42);
    for i in 1..=50_000u32 {
        let src = rng.gen_range(0..1000);
        let dest = rng.gen_range(0..1000);
        graph.add_edge(src, dest, i);
    }

    let dist = bfs(&graph, 0);
    assert_eq!(dist.len(), 1000);
    assert_eq!(dist[0], 0);
    let reached = dist.iter().filter(|&&d| d != UNREACHABLE).count();
    // A random graph this dense is connected in practice; at the very
    // least the start vertex and its neighborhood are reached.
    assert!(reached > 1, "bfs reached only the start vertex");
    for (v, &d) in dist.iter().enumerate() {
        if d != UNREACHABLE {
            assert!(d < 1000, "vertex {v} has impossible distance {d}");
        }
    }
}

#[test]
fn pagerank_over_random_edges() {
    let graph = PackedCsr::new(1000, SearchMode::Locked, 0);
    let mut rng = SmallRng::seed_from_u64(43);
    for i in 1..=50_000u32 {
        let src = rng.gen_range(0..1000);
        let dest = rng.gen_range(0..1000);
        graph.add_edge(src, dest, i);
    }
    let weights = vec![1.0f64; graph.vertex_count()];
    let ranks = strata::pagerank(&graph, &weights);
    assert_eq!(ranks.len(), 1000);
    // Contribution passes conserve mass over in-range destinations.
    let total: f64 = ranks.iter().sum();
    assert!(total > 0.0 && total <= 1000.0 + 1e-6);
}

#[test]
fn partitioned_store_with_many_partitions() {
    let store = PartitionedCsr::new(
        100,
        2,
        &StoreOptions {
            search_mode: SearchMode::Optimistic,
            partitions_per_domain: 2,
            numa: false,
        },
    );
    assert_eq!(store.partition_count(), 4);
    for v in 0..100u32 {
        store.add_edge(v, (v + 1) % 100, 1);
        store.add_edge(v, (v + 7) % 100, 2);
    }
    assert_eq!(store.vertex_count(), 100);
    for v in 0..100u32 {
        assert!(store.has_edge(v, (v + 1) % 100));
        assert!(store.has_edge(v, (v + 7) % 100));
        assert_eq!(store.degree(v), 2);
    }
    let dist = bfs(&store, 0);
    assert_eq!(dist.len(), 100);
    assert!(dist.iter().all(|&d| d != UNREACHABLE));
    assert!(store.locks_quiescent());
}
