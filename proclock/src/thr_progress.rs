//! Thread progress / quiescence.
//!
//! The table hands out plain references to processes, so it must not
//! recycle a slot while some thread is between "loaded the slot" and
//! "bumped the reference count". That window is bracketed by an
//! unmanaged-delay section: a counted RAII handle that slot retirement
//! waits out. Sections are short by contract; nothing blocks while one is
//! open (lookups end their section before falling back to a blocking
//! safelock).
//!
//! Threads may additionally register as scheduler threads. Registration
//! buys the larger lock spin budget; auxiliary (unregistered) threads use
//! the small one.

use std::cell::Cell;

use crate::loom_testing::*;

pub struct ThrProgress {
    /// Number of open unmanaged-delay sections
    unmanaged: AtomicUsize,
}

impl ThrProgress {
    pub(crate) fn new() -> Self {
        Self {
            unmanaged: AtomicUsize::new(0),
        }
    }

    /// Open an unmanaged-delay section. Slot retirement is held off until
    /// the returned handle is dropped.
    pub fn unmanaged_delay(&self) -> DelayHandle<'_> {
        // SeqCst pairs with the SeqCst retire marking in the table: either
        // the retiring thread sees our section, or we see the slot as dead
        self.unmanaged.fetch_add(1, Ordering::SeqCst);
        DelayHandle { progress: self }
    }

    /// Block until every currently open unmanaged-delay section has ended.
    ///
    /// Sections opened after this returns don't matter to callers: they
    /// can no longer observe whatever state change preceded the wait.
    pub fn wait_unmanaged_quiescence(&self) {
        let mut spins = 0u32;
        while self.unmanaged.load(Ordering::SeqCst) != 0 {
            spins += 1;
            spin_hint();
            if spins % 64 == 0 {
                thread_yield();
            }
        }
    }
}

/// RAII handle for one unmanaged-delay section.
pub struct DelayHandle<'a> {
    progress: &'a ThrProgress,
}

impl Drop for DelayHandle<'_> {
    fn drop(&mut self) {
        self.progress.unmanaged.fetch_sub(1, Ordering::SeqCst);
    }
}

thread_local! {
    static IS_SCHEDULER: Cell<bool> = Cell::new(false);
}

/// Mark the calling thread as a scheduler thread.
pub fn register_scheduler() {
    IS_SCHEDULER.with(|s| s.set(true));
}

/// Whether the calling thread registered as a scheduler thread.
pub fn is_scheduler() -> bool {
    IS_SCHEDULER.with(|s| s.get())
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn quiescence_waits_for_open_sections() {
        let tp = std::sync::Arc::new(ThrProgress::new());
        let tp2 = std::sync::Arc::clone(&tp);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let t = std::thread::spawn(move || {
            let d = tp2.unmanaged_delay();
            tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
            drop(d);
        });
        rx.recv().unwrap();
        tp.wait_unmanaged_quiescence();
        assert_eq!(tp.unmanaged.load(Ordering::SeqCst), 0);
        t.join().unwrap();
    }

    #[test]
    fn scheduler_registration_is_per_thread() {
        assert!(!is_scheduler());
        register_scheduler();
        assert!(is_scheduler());
        std::thread::spawn(|| assert!(!is_scheduler()))
            .join()
            .unwrap();
    }
}
