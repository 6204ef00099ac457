//! Thread/domain lookup tables and pool end-to-end behavior.

use std::collections::BTreeSet;

use strata::pool::domain_tables;
use strata::{RoutingMode, SearchMode, StoreOptions, ThreadPool};

#[test]
fn lookup_table_creation() {
    for domains in 1..=8usize {
        for threads in 1..=256usize {
            let (thread_domain, first_thread_domain, num_threads_domain) =
                domain_tables(threads, domains);

            assert_eq!(
                num_threads_domain.iter().sum::<usize>(),
                threads,
                "domains={domains} threads={threads}"
            );
            assert_eq!(first_thread_domain.len(), domains);
            assert_eq!(first_thread_domain[0], 0);

            let mut used = BTreeSet::new();
            for (i, &domain) in thread_domain.iter().enumerate() {
                assert!(
                    domain < domains,
                    "domains={domains} threads={threads} thread={i} domain={domain}"
                );
                used.insert(domain);
            }
            assert_eq!(
                used.len(),
                threads.min(domains),
                "domains={domains} threads={threads}"
            );

            // Sizes differ by at most one across domains.
            let sizes: BTreeSet<usize> = num_threads_domain.iter().copied().collect();
            assert!(!sizes.is_empty() && sizes.len() <= 2);
            if sizes.len() == 2 {
                let mut it = sizes.iter();
                let (lo, hi) = (*it.next().unwrap(), *it.next().unwrap());
                assert!(hi - lo <= 1 || lo == 0, "domains={domains} threads={threads}");
            }
        }
    }
}

fn run_bulk(routing: RoutingMode, search_mode: SearchMode, threads: usize) {
    let mut pool = ThreadPool::new(
        threads,
        100,
        Some(2),
        StoreOptions {
            search_mode,
            partitions_per_domain: 2,
            numa: false,
        },
        routing,
    );

    // Two rounds: queues only guarantee FIFO within themselves, so adds and
    // deletes of the same edge must not share a batch.
    let mut adds = Vec::new();
    for v in 0..100u32 {
        adds.push(strata::Update {
            op: strata::Op::Add,
            src: v,
            dest: (v + 1) % 100,
        });
        adds.push(strata::Update {
            op: strata::Op::Add,
            src: v,
            dest: (v + 13) % 100,
        });
    }
    pool.submit_bulk_update(&adds);
    pool.start(threads);
    pool.stop();

    // Then delete every ring edge of the even vertices.
    let deletes: Vec<strata::Update> = (0..100u32)
        .step_by(2)
        .map(|v| strata::Update {
            op: strata::Op::Delete,
            src: v,
            dest: (v + 1) % 100,
        })
        .collect();
    pool.submit_bulk_update(&deletes);
    pool.start(threads);
    pool.stop();

    let store = pool.store();
    for v in 0..100u32 {
        assert_eq!(store.has_edge(v, (v + 1) % 100), v % 2 == 1, "ring edge of {v}");
        assert!(store.has_edge(v, (v + 13) % 100), "chord edge of {v}");
    }
    assert!(store.locks_quiescent());
}

#[test]
fn bulk_update_balanced() {
    run_bulk(RoutingMode::Balanced, SearchMode::Locked, 4);
}

#[test]
fn bulk_update_clustered() {
    run_bulk(RoutingMode::Clustered, SearchMode::Optimistic, 4);
}

#[test]
fn bulk_update_single_thread() {
    run_bulk(RoutingMode::Balanced, SearchMode::Locked, 1);
}

#[test]
fn restartable_pool() {
    let mut pool = ThreadPool::new(
        2,
        50,
        Some(1),
        StoreOptions::default(),
        RoutingMode::Balanced,
    );
    for round in 0..3u32 {
        for v in 0..50u32 {
            pool.submit_add(0, v, round);
        }
        pool.start(2);
        pool.stop();
    }
    let store = pool.store();
    for v in 0..50u32 {
        assert_eq!(store.neighbors(v), vec![0, 1, 2]);
    }
    assert!(store.locks_quiescent());
}

#[test]
fn individual_submissions_interleave() {
    let mut pool = ThreadPool::new(
        4,
        64,
        Some(2),
        StoreOptions {
            search_mode: SearchMode::Optimistic,
            partitions_per_domain: 1,
            numa: false,
        },
        RoutingMode::Clustered,
    );
    for v in 0..64u32 {
        pool.submit_add(0, v, 63 - v);
        pool.submit_read(1, v);
    }
    pool.submit_delete(2, 0, 63);
    pool.start(4);
    pool.stop();

    let store = pool.store();
    assert!(!store.has_edge(0, 63));
    for v in 1..64u32 {
        assert!(store.has_edge(v, 63 - v));
    }
    assert!(store.locks_quiescent());
}
