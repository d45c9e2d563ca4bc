//! Multi-bit process locks.
//!
//! Long-lived objects ("processes") each carry a small fixed set of named
//! lock bits. A thread acquires any subset in one call and contention is
//! parked on per-bit fifo wait queues; release hands contended bits
//! directly to the head waiter so a bit is never observably free while
//! someone queues for it. A strict global order (ascending bit position,
//! then ascending pid for the same bit) plus the [proc_lock::LockPool::safelock]
//! reordering primitive makes multi-lock acquisition deadlock free.
//!
//! The uncontended paths cost one atomic read-modify-write.
//!
//! Layout:
//! - [proc_lock] — the flag word, wait queues and the acquire/release
//!   engine itself
//! - [pix] — the sharded spinlock pool guarding queues and waiter bits
//! - [tse] — per-thread blocking event slots
//! - [table] — the process table and lookup-with-lock
//! - [thr_progress] — quiescence for safe slot recycling
//! - [lock_check] — opt-in lock order verification (`lock-check` feature)

mod loom_testing;
mod util;

pub mod lock_check;
pub mod pix;
pub mod proc_lock;
pub mod table;
pub mod thr_progress;
pub mod tse;

pub use proc_lock::{LockPool, Locks, SpinTuning};
pub use table::{Lookup, LookupFlags, Pid, ProcTable, Process};
pub use tse::prepare_waiter;
