//! Thread event slots.
//!
//! Every thread that has to sleep for a process lock does so on its own
//! reusable wait slot: an event it can block on, an atomic "still waiting"
//! flag, and the intrusive links threading the slot onto a per-bit wait
//! queue. The slot is created lazily on first contention, cached in thread
//! local storage between waits, and torn down when the thread exits.
//!
//! A slot that sits on a wait queue is also referenced by whichever thread
//! performs the lock handoff. That thread still needs the slot alive for a
//! short window *after* it has allowed the waiter to continue (it signals
//! the event last), so the queue holds a counted reference for the whole
//! time the slot is enqueued. See [`pin`] / [`unpin_wake`].

use std::cell::{RefCell, UnsafeCell};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::loom_testing::*;
use crate::proc_lock::Locks;

/// A blocking primitive with set/reset/wait semantics.
///
/// `wait` may return spuriously as far as callers are concerned; the slow
/// path re-checks its condition around every return.
pub(crate) struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
    }
}

/// Intrusive queue state of a wait slot.
///
/// Only touched while holding the pix lock of the process being waited on,
/// or by the owning thread while the slot is idle (not enqueued anywhere).
pub(crate) struct WaitQueueState {
    pub(crate) next: Option<NonNull<WaitSlot>>,
    pub(crate) prev: Option<NonNull<WaitSlot>>,
    /// Locks this waiter still needs transferred to it
    pub(crate) needed: Locks,
}

/// Per-thread wait slot, one per thread, reused across waits.
pub(crate) struct WaitSlot {
    pub(crate) q: UnsafeCell<WaitQueueState>,
    /// Non-zero while the owning thread has not yet been granted all of
    /// `needed`. Cleared (with release ordering) by the thread completing
    /// the handoff, paired with the acquire load in the wait loop.
    pub(crate) waiting: AtomicU32,
    pub(crate) event: Event,
}

// safety: `q` is only accessed under the relevant pix lock or while the
// slot is idle and owned by one thread; everything else is atomic or
// internally synchronized.
unsafe impl Send for WaitSlot {}
unsafe impl Sync for WaitSlot {}

impl WaitSlot {
    pub(crate) fn new() -> Self {
        Self {
            q: UnsafeCell::new(WaitQueueState {
                next: None,
                prev: None,
                needed: Locks::empty(),
            }),
            waiting: AtomicU32::new(0),
            event: Event::new(),
        }
    }
}

thread_local! {
    static TSE_CACHE: RefCell<Option<Arc<WaitSlot>>> = RefCell::new(None);
}

/// Fetch the calling thread's wait slot, creating it on first use.
pub(crate) fn fetch() -> Arc<WaitSlot> {
    let slot = TSE_CACHE
        .with(|c| c.borrow_mut().take())
        .unwrap_or_else(|| Arc::new(WaitSlot::new()));
    // the slot is idle: it is on no queue and nothing is waking it
    unsafe {
        let q = &mut *slot.q.get();
        debug_assert!(q.needed.is_empty());
        q.next = None;
        q.prev = None;
    }
    slot.waiting.store(0, Ordering::Relaxed);
    slot.event.reset();
    slot
}

/// Return a wait slot to the thread-local cache.
pub(crate) fn give_back(slot: Arc<WaitSlot>) {
    debug_assert!(unsafe { (*slot.q.get()).needed.is_empty() });
    TSE_CACHE.with(|c| *c.borrow_mut() = Some(slot));
}

/// Take a counted reference on behalf of a wait queue.
///
/// Must be called (under the pix lock) when the slot is first enqueued;
/// the matching [`unpin_wake`] runs after the handoff completes.
pub(crate) fn pin(slot: &Arc<WaitSlot>) {
    let _ = Arc::into_raw(Arc::clone(slot));
}

/// Wake a fully served waiter and drop the queue's reference.
///
/// The reference taken by [`pin`] keeps the slot alive across the
/// store/set pair even if the owning thread observes `waiting == 0`,
/// returns its slot, and exits before `set` runs.
///
/// # Safety
///
/// `slot` must have been pinned via [`pin`] and since removed from every
/// wait queue, with its `needed` set drained.
pub(crate) unsafe fn unpin_wake(slot: NonNull<WaitSlot>) {
    let slot = Arc::from_raw(slot.as_ptr() as *const WaitSlot);
    slot.waiting.store(0, Ordering::Release);
    slot.event.set();
}

/// Pre-install the calling thread's wait slot so that the first contended
/// acquisition does not have to allocate.
pub fn prepare_waiter() {
    give_back(fetch());
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn event_set_then_wait_does_not_block() {
        let ev = Event::new();
        ev.set();
        ev.wait();
    }

    #[test]
    fn event_wakes_cross_thread() {
        let ev = Arc::new(Event::new());
        let ev2 = Arc::clone(&ev);
        let t = std::thread::spawn(move || {
            ev2.wait();
        });
        // racing set against the wait is the whole point
        ev.set();
        t.join().unwrap();
    }

    #[test]
    fn slot_cache_round_trip() {
        prepare_waiter();
        let a = fetch();
        let a_ptr = Arc::as_ptr(&a);
        give_back(a);
        let b = fetch();
        assert_eq!(a_ptr, Arc::as_ptr(&b));
        give_back(b);
    }
}
