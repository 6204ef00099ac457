//! Synchronization primitives for the packed memory array.
//!
//! Two locks cooperate per partition:
//! - [`HybridLock`]: a reader/writer lock carrying a monotonic version
//!   counter, one per PMA leaf. The version lets optimistic readers detect
//!   concurrent mutation and retry instead of holding locks while searching.
//! - [`ResizeGate`]: the partition-wide shared/exclusive gate that protects
//!   array resizes, with a registration fast path that makes the shared
//!   acquisition a no-op for worker threads in the common case.

pub mod hybrid_lock;
pub mod resize_gate;

pub use hybrid_lock::HybridLock;
pub use resize_gate::ResizeGate;
