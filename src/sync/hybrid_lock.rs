//! A reader/writer lock with a monotonic version counter.
//!
//! # State encoding
//!
//! One `AtomicU32` holds the whole lock state:
//! - bit 31: exclusive holder present
//! - bit 30: a writer is waiting (blocks new readers, keeps writers from
//!   starving under reader traffic)
//! - bits 0..30: reader count
//!
//! The version counter is a separate `AtomicU64`. Only the exclusive holder
//! may increment it; readers load it without any locking. An optimistic
//! reader records the version before its reads and compares after acquiring
//! the lock; a mismatch means the protected region changed underneath it
//! and the operation must retry.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const WRITER: u32 = 1 << 31;
const PENDING: u32 = 1 << 30;
const READER_MASK: u32 = PENDING - 1;

/// Iterations of `spin_loop` before falling back to `yield_now`.
const SPIN_LIMIT: u32 = 40;

/// Reader/writer lock plus seqlock-style version token.
pub struct HybridLock {
    state: AtomicU32,
    version: AtomicU64,
}

impl Default for HybridLock {
    fn default() -> Self {
        Self::new()
    }
}

impl HybridLock {
    /// Creates an unlocked lock with version 0.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            version: AtomicU64::new(0),
        }
    }

    /// Acquires the lock exclusively, blocking until available.
    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spin = 0u32;
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & (WRITER | READER_MASK) == 0 {
                // Free apart from a possible pending bit (ours or a rival's);
                // claiming the lock consumes it.
                if self
                    .state
                    .compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if s & PENDING == 0 {
                // Announce intent so new readers hold off.
                self.state.fetch_or(PENDING, Ordering::Relaxed);
            }
            if spin < SPIN_LIMIT {
                spin += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Releases the exclusive lock.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) & WRITER != 0);
        // Preserve a rival writer's pending bit.
        self.state.fetch_and(!WRITER, Ordering::Release);
    }

    /// Attempts to acquire the lock exclusively without blocking.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the lock in shared mode, blocking until available.
    #[inline]
    pub fn lock_shared(&self) {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | PENDING) == 0
            && self
                .state
                .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        self.lock_shared_slow();
    }

    #[cold]
    fn lock_shared_slow(&self) {
        let mut spin = 0u32;
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & (WRITER | PENDING) == 0 {
                if self
                    .state
                    .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if spin < SPIN_LIMIT {
                spin += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Releases a shared hold.
    #[inline]
    pub fn unlock_shared(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) & READER_MASK != 0);
        self.state.fetch_sub(1, Ordering::Release);
    }

    /// Returns whether the lock could be acquired exclusively right now.
    ///
    /// Acquires and immediately releases; only meaningful as a quiescence
    /// probe between operations (tests use it to assert no lock leaked).
    pub fn is_lockable(&self) -> bool {
        if self.try_lock() {
            self.unlock();
            true
        } else {
            false
        }
    }

    /// Loads the current version. Never blocks.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Increments the version counter.
    ///
    /// Callers must hold the exclusive lock; the bump publishes the mutation
    /// to optimistic readers that will re-check their recorded version.
    #[inline]
    pub fn bump_version(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) & WRITER != 0);
        self.version.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn exclusive_excludes_shared() {
        let lock = HybridLock::new();
        lock.lock();
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.is_lockable());
    }

    #[test]
    fn shared_is_reentrant_across_threads() {
        let lock = HybridLock::new();
        lock.lock_shared();
        lock.lock_shared();
        assert!(!lock.try_lock());
        lock.unlock_shared();
        lock.unlock_shared();
        assert!(lock.is_lockable());
    }

    #[test]
    fn version_only_moves_under_exclusive() {
        let lock = HybridLock::new();
        assert_eq!(lock.version(), 0);
        lock.lock();
        lock.bump_version();
        lock.unlock();
        assert_eq!(lock.version(), 1);
    }

    #[test]
    fn writers_make_progress_under_contention() {
        let lock = HybridLock::new();
        let counter = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        lock.lock();
                        counter.fetch_add(1, Ordering::Relaxed);
                        lock.bump_version();
                        lock.unlock();
                    }
                });
            }
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        lock.lock_shared();
                        let _ = lock.version();
                        lock.unlock_shared();
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert_eq!(lock.version(), 4000);
        assert!(lock.is_lockable());
    }
}
