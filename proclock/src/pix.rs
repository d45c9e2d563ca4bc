//! Pix ("process index") locks.
//!
//! A fixed pool of short spinlocks sharding the process table. Every
//! process maps to one pool slot by hashing its pid. A pix lock protects,
//! for all processes mapping to it:
//! - the per-bit wait queues,
//! - every modification of a waiter bit in the flag word,
//! - the enqueue/dequeue-to-wakeup handoff.
//!
//! Critical sections are short and never block, so a spinlock with a
//! spin hint is enough; there is no parking here.

use std::hash::{Hash, Hasher};

use crate::loom_testing::*;
use crate::table::Pid;

/// Number of pix locks. Power of two.
#[cfg(not(loom))]
pub const NO_OF_PIX_LOCKS: usize = 256;
#[cfg(loom)]
pub const NO_OF_PIX_LOCKS: usize = 4;

const _: () = assert!(NO_OF_PIX_LOCKS.is_power_of_two());

/// hash using [rustc_hash::FxHasher]
fn hash<K: Hash>(key: &K) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

pub(crate) struct PixLock {
    locked: AtomicU32,
}

impl PixLock {
    fn new() -> Self {
        Self {
            locked: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> PixGuard<'_> {
        'outer_spin: loop {
            let mut old = self.locked.load(Ordering::Relaxed);
            loop {
                if old != 0 {
                    spin_hint();
                    continue 'outer_spin;
                }
                match self
                    .locked
                    .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                {
                    Ok(_) => return PixGuard(self),
                    Err(x) => old = x,
                }
            }
        }
    }
}

/// RAII guard for one pix lock.
///
/// Holding the guard is what licenses wait queue and waiter bit edits for
/// every process hashing to this slot.
pub(crate) struct PixGuard<'a>(&'a PixLock);

impl Drop for PixGuard<'_> {
    fn drop(&mut self) {
        self.0.locked.store(0, Ordering::Release);
    }
}

/// The pool of pix locks.
pub struct PixPool {
    locks: Box<[PixLock]>,
}

impl PixPool {
    pub(crate) fn new() -> Self {
        Self {
            locks: (0..NO_OF_PIX_LOCKS).map(|_| PixLock::new()).collect(),
        }
    }

    /// Lock the pix slot for `pid`.
    pub(crate) fn lock_for(&self, pid: Pid) -> PixGuard<'_> {
        let ix = (hash(&pid.raw()) as usize) & (NO_OF_PIX_LOCKS - 1);
        self.locks[ix].lock()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pix_guard_excludes() {
        let pool = Arc::new(PixPool::new());
        let counter = Arc::new(std::cell::UnsafeCell::new(0u64));

        struct SendPtr(Arc<std::cell::UnsafeCell<u64>>);
        unsafe impl Send for SendPtr {}
        unsafe impl Sync for SendPtr {}
        let counter = Arc::new(SendPtr(counter));

        let pid = Pid::from_raw(17);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let _g = pool.lock_for(pid);
                    // non-atomic increment; only sound if the lock excludes
                    unsafe { *counter.0.get() += 1 }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let _g = pool.lock_for(pid);
        assert_eq!(unsafe { *counter.0.get() }, 40_000);
    }
}
