//! Driver: load a core graph, apply a bounded update stream through the
//! worker pool, and report wall-clock time plus a BFS sanity pass.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use strata::{bfs, read_updates, Op, RoutingMode, SearchMode, StoreOptions, ThreadPool, UNREACHABLE};

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum Mode {
    /// Single packed array, no partitioning.
    Ppcsr,
    /// Partitioned store without NUMA pinning.
    Pppcsr,
    /// Partitioned store with NUMA pinning.
    PppcsrNuma,
}

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Concurrent packed-memory graph store driver")]
struct Args {
    /// Worker threads (the caller becomes worker 0).
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Maximum number of updates to apply.
    #[arg(long, default_value_t = 1_000_000)]
    size: usize,

    /// Treat unmarked update lines as insertions (the default).
    #[arg(long, conflicts_with = "delete")]
    insert: bool,

    /// Treat unmarked update lines as deletions.
    #[arg(long)]
    delete: bool,

    /// Search without leaf locks (optimistic, version-validated).
    #[arg(long)]
    lock_free: bool,

    /// Edge list establishing the initial graph.
    #[arg(long)]
    core_graph: PathBuf,

    /// Edge list with the updates to apply.
    #[arg(long)]
    update_file: PathBuf,

    /// Store layout.
    #[arg(long, value_enum, default_value_t = Mode::PppcsrNuma)]
    mode: Mode,

    /// Partitions carved out of each NUMA domain.
    #[arg(long, default_value_t = 1)]
    partitions_per_domain: usize,

    /// Round-robin submissions across queues (the default).
    #[arg(long, conflicts_with = "cluster")]
    balance: bool,

    /// Queue submissions by source partition.
    #[arg(long)]
    cluster: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let (core, core_max) = read_updates(&args.core_graph, Op::Add)
        .with_context(|| format!("loading core graph {}", args.core_graph.display()))?;
    anyhow::ensure!(!core.is_empty(), "core graph {} is empty", args.core_graph.display());

    let default_op = if args.delete && !args.insert {
        Op::Delete
    } else {
        Op::Add
    };
    let (updates, update_max) = read_updates(&args.update_file, default_op)
        .with_context(|| format!("loading update file {}", args.update_file.display()))?;
    anyhow::ensure!(
        !updates.is_empty(),
        "update file {} is empty",
        args.update_file.display()
    );

    let vertex_count = core_max.max(update_max) + 1;
    let search_mode = if args.lock_free {
        SearchMode::Optimistic
    } else {
        SearchMode::Locked
    };
    let (domains, partitions_per_domain, numa) = match args.mode {
        Mode::Ppcsr => (Some(1), 1, false),
        Mode::Pppcsr => (None, args.partitions_per_domain, false),
        Mode::PppcsrNuma => (None, args.partitions_per_domain, true),
    };
    let routing = if args.cluster && !args.balance {
        RoutingMode::Clustered
    } else {
        RoutingMode::Balanced
    };

    let mut pool = ThreadPool::new(
        args.threads,
        vertex_count,
        domains,
        StoreOptions {
            search_mode,
            partitions_per_domain,
            numa,
        },
        routing,
    );

    // Load the core graph.
    pool.submit_bulk_update(&core);
    pool.start(args.threads);
    pool.stop();
    println!(
        "core graph: {} edges over {} vertices",
        core.len(),
        vertex_count
    );

    // Apply the bounded update stream.
    let batch = &updates[..updates.len().min(args.size)];
    let t0 = Instant::now();
    pool.submit_bulk_update(batch);
    pool.start(args.threads);
    pool.stop();
    let elapsed = t0.elapsed();
    println!(
        "applied {} updates in {} ms ({:.0} ops/s)",
        batch.len(),
        elapsed.as_millis(),
        batch.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    // Sanity: traverse from vertex 0 over the quiescent store.
    let dist = bfs(pool.store().as_ref(), 0);
    let reached = dist.iter().filter(|&&d| d != UNREACHABLE).count();
    println!("bfs from 0 reached {reached} of {} vertices", dist.len());

    Ok(())
}
