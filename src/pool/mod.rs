//! The worker pool that executes batches of graph updates.
//!
//! Construction sizes one MPMC queue per worker slot and builds the
//! underlying [`PartitionedCsr`]. `start(T)` launches `T - 1` workers and
//! runs the caller as worker 0 (the master); each worker drains its home
//! queue and steals from the others round-robin when idle. `stop()` signals
//! completion and joins, after which the store is quiescent and analytics
//! may run without writer activity.
//!
//! Routing modes:
//! - *Balanced*: `min(D·P, T)` queues, submissions round-robin across them.
//! - *Clustered*: `ceil(T / threads_per_domain)` queues, a task lands on
//!   `partition(src) % Q` for locality at the cost of balance.
//!
//! Workers track which partition they are touching and keep themselves
//! registered on that partition's resize gate, so the gate's shared fast
//! path applies to the hot loop; an idle worker unregisters so it never
//! stalls a resize.

pub mod task;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;

use crate::input::{Op, Update};
use crate::numa::{self, Topology};
use crate::partition::{PartitionedCsr, StoreOptions};
pub use task::Task;

/// How submissions map to queues.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RoutingMode {
    /// Round-robin across queues; even load, no locality.
    #[default]
    Balanced,
    /// Queue by source partition; locality, possibly uneven load.
    Clustered,
}

/// Worker pool over a partitioned graph store.
pub struct ThreadPool {
    store: Arc<PartitionedCsr>,
    queues: Arc<Vec<SegQueue<Task>>>,
    finished: Arc<AtomicBool>,
    topology: Arc<Topology>,
    workers: Vec<JoinHandle<()>>,
    routing: RoutingMode,
    pin_workers: bool,
    queue_turn: CachePadded<AtomicUsize>,
    thread_domain: Vec<usize>,
    first_thread_domain: Vec<usize>,
    num_threads_domain: Vec<usize>,
    started_at: Option<Instant>,
}

/// Splits `threads` workers across `domains` as evenly as possible
/// (difference at most one). Returns `(thread_domain, first_thread_domain,
/// num_threads_domain)`.
pub fn domain_tables(threads: usize, domains: usize) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
    let d = domains.max(1);
    let min_threads = threads / d;
    let threshold = threads % d;
    let mut thread_domain = vec![0usize; threads];
    let mut first_thread_domain = vec![0usize; d];
    let mut num_threads_domain = vec![0usize; d];
    let mut counter = 0usize;
    let mut current = 0usize;
    for (i, slot) in thread_domain.iter_mut().enumerate() {
        *slot = current;
        counter += 1;
        if counter == min_threads + usize::from(current < threshold) {
            num_threads_domain[current] = counter;
            first_thread_domain[current] = i + 1 - counter;
            counter = 0;
            current += 1;
        }
    }
    (thread_domain, first_thread_domain, num_threads_domain)
}

impl ThreadPool {
    /// Builds the store and the queue set for up to `threads` workers.
    ///
    /// `domains` overrides the detected NUMA domain count (a single-PMA
    /// store is `Some(1)` with one partition per domain).
    pub fn new(
        threads: usize,
        vertex_count: u32,
        domains: Option<usize>,
        options: StoreOptions,
        routing: RoutingMode,
    ) -> Self {
        assert!(threads >= 1, "pool needs at least the master thread");
        let topology = Arc::new(Topology::detect());
        let domains = domains.unwrap_or_else(|| topology.domain_count()).max(1);
        let store = Arc::new(PartitionedCsr::new(vertex_count, domains, &options));

        let queue_count = match routing {
            RoutingMode::Balanced => (domains * options.partitions_per_domain.max(1))
                .min(threads)
                .max(1),
            RoutingMode::Clustered => {
                let threads_per_domain = (topology.cpu_count() / domains).max(1);
                threads.div_ceil(threads_per_domain).max(1)
            }
        };
        let queues = Arc::new((0..queue_count).map(|_| SegQueue::new()).collect::<Vec<_>>());

        let (thread_domain, first_thread_domain, num_threads_domain) =
            domain_tables(threads, domains);
        tracing::debug!(
            threads,
            domains,
            queues = queue_count,
            ?routing,
            "pool configured"
        );

        Self {
            store,
            queues,
            finished: Arc::new(AtomicBool::new(false)),
            topology,
            workers: Vec::new(),
            routing,
            pin_workers: options.numa,
            queue_turn: CachePadded::new(AtomicUsize::new(0)),
            thread_domain,
            first_thread_domain,
            num_threads_domain,
            started_at: None,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<PartitionedCsr> {
        &self.store
    }

    /// Thread-to-domain assignments computed at construction.
    pub fn thread_domains(&self) -> &[usize] {
        &self.thread_domain
    }

    /// First worker id of each domain.
    pub fn first_thread_of_domains(&self) -> &[usize] {
        &self.first_thread_domain
    }

    /// Worker count of each domain.
    pub fn threads_per_domain(&self) -> &[usize] {
        &self.num_threads_domain
    }

    #[inline]
    fn route(&self, src: u32) -> usize {
        match self.routing {
            RoutingMode::Balanced => {
                self.queue_turn.fetch_add(1, Ordering::Relaxed) % self.queues.len()
            }
            RoutingMode::Clustered => self.store.partition_of(src) % self.queues.len(),
        }
    }

    /// Enqueues an edge insertion. `_thread_id` identifies the submitting
    /// producer slot; routing itself depends only on the mode.
    pub fn submit_add(&self, _thread_id: usize, src: u32, dest: u32) {
        self.queues[self.route(src)].push(Task::Add { src, dest });
    }

    /// Enqueues an edge deletion.
    pub fn submit_delete(&self, _thread_id: usize, src: u32, dest: u32) {
        self.queues[self.route(src)].push(Task::Delete { src, dest });
    }

    /// Enqueues a neighborhood scan.
    pub fn submit_read(&self, _thread_id: usize, src: u32) {
        self.queues[self.route(src)].push(Task::Read { src });
    }

    /// Splits an ordered batch across the queues with the configured
    /// routing. Order is preserved only within a queue.
    pub fn submit_bulk_update(&self, updates: &[Update]) {
        for u in updates {
            let task = match u.op {
                Op::Add => Task::Add {
                    src: u.src,
                    dest: u.dest,
                },
                Op::Delete => Task::Delete {
                    src: u.src,
                    dest: u.dest,
                },
            };
            self.queues[self.route(u.src)].push(task);
        }
    }

    /// Launches `threads - 1` workers and runs the caller as worker 0.
    ///
    /// Returns once every queue has been observed empty; workers keep
    /// stealing until [`stop`](Self::stop).
    pub fn start(&mut self, threads: usize) {
        assert!(
            threads <= self.thread_domain.len(),
            "start() exceeds the pool's configured worker count"
        );
        self.finished.store(false, Ordering::Release);
        self.started_at = Some(Instant::now());

        for id in 1..threads {
            let store = Arc::clone(&self.store);
            let queues = Arc::clone(&self.queues);
            let finished = Arc::clone(&self.finished);
            let topology = Arc::clone(&self.topology);
            let domain = self.thread_domain[id];
            let home = id % self.queues.len();
            let pin = self.pin_workers;
            self.workers.push(std::thread::spawn(move || {
                run_worker(&store, &queues, &finished, &topology, domain, home, pin, false);
            }));
        }
        let home = 0;
        run_worker(
            &self.store,
            &self.queues,
            &self.finished,
            &self.topology,
            self.thread_domain[0],
            home,
            self.pin_workers,
            true,
        );
    }

    /// Signals completion and joins the workers. On return every submitted
    /// operation has retired and the store is quiescent.
    pub fn stop(&mut self) {
        self.finished.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(t0) = self.started_at.take() {
            tracing::debug!(elapsed_ms = t0.elapsed().as_millis() as u64, "pool drained");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    store: &PartitionedCsr,
    queues: &[SegQueue<Task>],
    finished: &AtomicBool,
    topology: &Topology,
    domain: usize,
    home: usize,
    pin: bool,
    master: bool,
) {
    if pin {
        numa::pin_current_thread(topology, domain);
    }
    let queue_count = queues.len();
    let mut registered: Option<usize> = None;

    loop {
        let mut task = queues[home].pop();
        if task.is_none() {
            for k in 1..queue_count {
                if let Some(stolen) = queues[(home + k) % queue_count].pop() {
                    task = Some(stolen);
                    break;
                }
            }
        }
        match task {
            Some(task) => {
                let partition = store.partition_of(task.src());
                if registered != Some(partition) {
                    if let Some(prev) = registered {
                        store.unregister_thread(prev);
                    }
                    store.register_thread(partition);
                    registered = Some(partition);
                }
                match task {
                    Task::Add { src, dest } => store.add_edge(src, dest, 1),
                    Task::Delete { src, dest } => store.remove_edge(src, dest),
                    Task::Read { src } => {
                        store.scan_neighborhood(src);
                    }
                }
            }
            None => {
                // Never sit registered while idle; a resize would wait on us.
                if let Some(prev) = registered.take() {
                    store.unregister_thread(prev);
                }
                if master || finished.load(Ordering::Acquire) {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }
    if let Some(prev) = registered.take() {
        store.unregister_thread(prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_tables_split_evenly() {
        let (thread_domain, first, num) = domain_tables(5, 2);
        assert_eq!(thread_domain, vec![0, 0, 0, 1, 1]);
        assert_eq!(first, vec![0, 3]);
        assert_eq!(num, vec![3, 2]);
        assert_eq!(num.iter().sum::<usize>(), 5);
    }

    #[test]
    fn fewer_threads_than_domains() {
        let (thread_domain, _, num) = domain_tables(2, 4);
        assert_eq!(thread_domain, vec![0, 1]);
        assert_eq!(num[0], 1);
        assert_eq!(num[1], 1);
        assert_eq!(num[2], 0);
    }

    #[test]
    fn single_threaded_drain() {
        let mut pool = ThreadPool::new(1, 16, Some(1), StoreOptions::default(), RoutingMode::Balanced);
        pool.submit_add(0, 1, 2);
        pool.submit_add(0, 1, 3);
        pool.submit_delete(0, 1, 2);
        pool.submit_read(0, 1);
        pool.start(1);
        pool.stop();
        let store = pool.store();
        assert!(!store.has_edge(1, 2));
        assert!(store.has_edge(1, 3));
        assert!(store.locks_quiescent());
    }
}
