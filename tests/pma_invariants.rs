//! Structural invariants of the packed array after operation sequences.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use strata::{PackedCsr, SearchMode};

fn assert_invariants(graph: &PackedCsr, context: &str) {
    assert!(graph.is_sorted(), "{context}: neighborhood out of order");
    assert!(
        graph.sentinels_consistent(),
        "{context}: sentinel bookkeeping broken"
    );
    assert!(graph.degrees_consistent(), "{context}: degree drifted");
    assert!(graph.locks_quiescent(), "{context}: lock leaked");
}

#[test]
fn fresh_store_is_uniform() {
    for count in [0u32, 1, 2, 10, 1000] {
        let graph = PackedCsr::new(count, SearchMode::Locked, 0);
        assert_eq!(graph.vertex_count(), count as usize);
        assert_eq!(graph.count_edges(), 0);
        assert_invariants(&graph, &format!("fresh n={count}"));
        // A lone sentinel legitimately leaves whole leaves empty, so the
        // density window only means something from two vertices up.
        if count >= 2 {
            assert!(
                graph.density_within_bounds(),
                "fresh store n={count} violates density bounds"
            );
        }
    }
}

#[test]
fn growth_through_doubling() {
    // A tiny array forced through several doublings.
    let graph = PackedCsr::new(2, SearchMode::Locked, 0);
    for i in 1..=100u32 {
        graph.add_edge(0, i, i);
        graph.add_edge(1, i, i);
    }
    assert_eq!(graph.degree(0), 100);
    assert_eq!(graph.degree(1), 100);
    assert_eq!(graph.count_edges(), 200);
    assert_invariants(&graph, "after growth");

    let n0: Vec<u32> = (1..=100).collect();
    assert_eq!(graph.neighbors(0), n0);
}

#[test]
fn shrink_through_halving() {
    let graph = PackedCsr::new(4, SearchMode::Locked, 0);
    for i in 1..=200u32 {
        graph.add_edge(2, i, 1);
    }
    let grown = graph.footprint_bytes();
    for i in 1..=200u32 {
        graph.remove_edge(2, i);
        assert_invariants(&graph, &format!("during drain i={i}"));
    }
    assert_eq!(graph.count_edges(), 0);
    assert!(
        graph.footprint_bytes() < grown,
        "array never shrank after drain"
    );
}

#[test]
fn overwrite_keeps_degree_stable() {
    let graph = PackedCsr::new(4, SearchMode::Locked, 0);
    graph.add_edge(1, 2, 7);
    graph.add_edge(1, 2, 9);
    graph.add_edge(1, 2, 11);
    assert_eq!(graph.degree(1), 1);
    assert_eq!(graph.edges(), vec![(1, 2, 11)]);
    assert_invariants(&graph, "after overwrites");
}

#[test]
fn absent_removal_keeps_degree_stable() {
    let graph = PackedCsr::new(4, SearchMode::Optimistic, 0);
    graph.add_edge(1, 2, 7);
    graph.remove_edge(1, 3);
    graph.remove_edge(0, 2);
    graph.remove_edge(3, 9);
    assert_eq!(graph.degree(1), 1);
    assert_eq!(graph.degree(0), 0);
    assert_invariants(&graph, "after absent removals");
}

#[test]
fn zero_weight_and_out_of_range_are_noops() {
    let graph = PackedCsr::new(4, SearchMode::Locked, 0);
    graph.add_edge(0, 1, 0);
    graph.add_edge(9, 1, 5);
    assert_eq!(graph.count_edges(), 0);
    assert_invariants(&graph, "after rejected inserts");
}

#[test]
fn appended_vertices_interleave_with_edges() {
    let graph = PackedCsr::new(2, SearchMode::Locked, 0);
    for round in 0..20u32 {
        graph.add_vertex();
        let count = graph.vertex_count() as u32;
        for v in 0..count {
            graph.add_edge(v, round, round + 1);
        }
        assert_invariants(&graph, &format!("after round {round}"));
    }
    assert_eq!(graph.vertex_count(), 22);
    // Every vertex saw all rounds from its birth onward.
    assert_eq!(graph.degree(0), 20);
    assert_eq!(graph.degree(2), 20); // added in round 0
    assert_eq!(graph.degree(21), 1); // added in round 19
}

#[test]
fn randomized_churn_preserves_structure() {
    for mode in [SearchMode::Locked, SearchMode::Optimistic] {
        let graph = PackedCsr::new(50, mode, 0);
        let mut rng = SmallRng::seed_from_u64(7);
        for i in 1..=20_000u32 {
            let src = rng.gen_range(0..50);
            let dest = rng.gen_range(0..200);
            if rng.gen_bool(0.7) {
                graph.add_edge(src, dest, i);
            } else {
                graph.remove_edge(src, dest);
            }
        }
        assert_invariants(&graph, "after churn");
        let recount: usize = (0..50u32).map(|v| graph.neighbors(v).len()).sum();
        assert_eq!(recount, graph.count_edges());
    }
}
