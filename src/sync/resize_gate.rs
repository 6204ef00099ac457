//! The partition-wide gate that protects array resizes.
//!
//! Every operation on a packed memory array holds this gate in shared mode;
//! doubling or halving the array requires it exclusively. Taking even an
//! uncontended shared lock on every edge update is measurable, so the gate
//! adds a registration fast path: a registered thread's `lock_shared` is a
//! plain load of `write_pending` unless a writer has announced intent.
//!
//! The writer's side of the bargain: after taking the inner lock it waits
//! until every registered thread has parked at an operation boundary
//! (`arrived >= registered`, counting itself when the calling thread is
//! itself registered). A registered thread reaches a boundary at its next
//! `lock_shared`/`unlock_shared`, where it pairs an `arrived` increment with
//! parking on the inner shared lock until the writer is done.
//!
//! # Contract
//!
//! Threads mutating the same array concurrently must either register
//! (workers do, per partition they touch) or skip registration entirely and
//! accept that their shared acquisitions are fast-path no-ops only safe
//! without a concurrent writer. A registered thread that goes idle must
//! unregister, or writers wait on it forever.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::sync::HybridLock;

thread_local! {
    // Addresses of the gates the current thread is registered with. Touched
    // only on register/unregister and on the cold exclusive path.
    static REGISTERED_WITH: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Shared/exclusive resize gate with a registered-reader fast path.
pub struct ResizeGate {
    inner: HybridLock,
    write_pending: AtomicBool,
    registered: AtomicU32,
    arrived: AtomicU32,
}

impl Default for ResizeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ResizeGate {
    /// Creates an open gate with no registered threads.
    pub const fn new() -> Self {
        Self {
            inner: HybridLock::new(),
            write_pending: AtomicBool::new(false),
            registered: AtomicU32::new(0),
            arrived: AtomicU32::new(0),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Registers the calling thread as an implicit shared holder.
    pub fn register_thread(&self) {
        self.registered.fetch_add(1, Ordering::SeqCst);
        REGISTERED_WITH.with(|r| r.borrow_mut().push(self.addr()));
    }

    /// Removes the calling thread from the implicit-holder set.
    pub fn unregister_thread(&self) {
        REGISTERED_WITH.with(|r| {
            let mut v = r.borrow_mut();
            if let Some(pos) = v.iter().position(|&a| a == self.addr()) {
                v.swap_remove(pos);
            }
        });
        self.registered.fetch_sub(1, Ordering::SeqCst);
    }

    fn caller_is_registered(&self) -> bool {
        REGISTERED_WITH.with(|r| r.borrow().contains(&self.addr()))
    }

    /// Acquires the gate exclusively.
    ///
    /// Waits for the inner lock, then for every registered thread to park at
    /// an operation boundary. A registered caller (a worker escalating to a
    /// resize) counts itself as arrived, so it does not deadlock on its own
    /// registration.
    pub fn lock(&self) {
        let self_registered = self.caller_is_registered();
        if self_registered {
            self.arrived.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.lock();
        self.write_pending.store(true, Ordering::SeqCst);
        while self.arrived.load(Ordering::SeqCst) < self.registered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        if self_registered {
            self.arrived.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Releases the exclusive hold and reopens the fast path.
    pub fn unlock(&self) {
        self.write_pending.store(false, Ordering::SeqCst);
        self.inner.unlock();
    }

    /// Acquires the gate in shared mode.
    ///
    /// Fast path: nothing to do while no writer is pending. Otherwise park
    /// on the inner lock until the writer completes.
    #[inline]
    pub fn lock_shared(&self) {
        if self.write_pending.load(Ordering::SeqCst) {
            self.quiesce();
        }
    }

    /// Releases a shared hold, parking first if a writer is waiting.
    #[inline]
    pub fn unlock_shared(&self) {
        if self.write_pending.load(Ordering::SeqCst) {
            self.quiesce();
        }
    }

    #[cold]
    fn quiesce(&self) {
        self.arrived.fetch_add(1, Ordering::SeqCst);
        self.inner.lock_shared();
        self.arrived.fetch_sub(1, Ordering::SeqCst);
        self.inner.unlock_shared();
    }

    /// Quiescence probe: whether the gate could be taken exclusively now.
    pub fn is_lockable(&self) -> bool {
        self.inner.is_lockable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn exclusive_round_trip() {
        let gate = ResizeGate::new();
        gate.lock();
        assert!(!gate.is_lockable());
        gate.unlock();
        assert!(gate.is_lockable());
    }

    #[test]
    fn unregistered_shared_is_free() {
        let gate = ResizeGate::new();
        gate.lock_shared();
        // Fast path holds nothing, so the gate stays exclusively lockable.
        assert!(gate.is_lockable());
        gate.unlock_shared();
    }

    #[test]
    fn writer_waits_for_registered_readers() {
        let gate = ResizeGate::new();
        let in_write = AtomicUsize::new(0);
        let observed = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    gate.register_thread();
                    for _ in 0..10_000 {
                        gate.lock_shared();
                        // A writer must never be inside its critical section
                        // while a registered reader is between the brackets.
                        observed.fetch_max(in_write.load(Ordering::SeqCst), Ordering::SeqCst);
                        gate.unlock_shared();
                    }
                    gate.unregister_thread();
                });
            }
            s.spawn(|| {
                for _ in 0..50 {
                    gate.lock();
                    in_write.store(1, Ordering::SeqCst);
                    std::thread::yield_now();
                    in_write.store(0, Ordering::SeqCst);
                    gate.unlock();
                }
            });
        });
        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert!(gate.is_lockable());
    }

    #[test]
    fn registered_escalation_does_not_self_deadlock() {
        let gate = ResizeGate::new();
        gate.register_thread();
        gate.lock_shared();
        gate.unlock_shared();
        gate.lock();
        gate.unlock();
        gate.unregister_thread();
        assert!(gate.is_lockable());
    }
}
