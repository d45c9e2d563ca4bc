//! Lock order checking (the `lock-check` feature).
//!
//! Every thread keeps a stack of the process lock bits it holds, as
//! `(bit, pid)` pairs. The total acquisition order sorts bit position
//! first, then pid: a blocking acquisition must be strictly greater than
//! everything already held. Violations are bugs, not runtime conditions,
//! and abort with a diagnostic listing the held set.
//!
//! Trylocks never block, so they are allowed out of order; they are still
//! recorded so that releases and recursion checks stay exact.
//!
//! Production builds compile all of this to nothing.

#[cfg(feature = "lock-check")]
mod imp {
    use std::cell::RefCell;

    use crate::loom_testing::thread_local;
    use crate::proc_lock::{Locks, MAX_LOCK_BIT};
    use crate::table::Pid;

    #[derive(Clone, Copy)]
    struct Held {
        bit_no: u32,
        pid: Pid,
        /// acquired through a trylock, exempt from order comparison
        trylocked: bool,
    }

    thread_local! {
        static HELD: RefCell<Vec<Held>> = RefCell::new(Vec::new());
    }

    fn name_of(bit_no: u32) -> &'static str {
        match bit_no {
            0 => "main",
            1 => "msgq",
            2 => "btm",
            3 => "status",
            4 => "trace",
            _ => "?",
        }
    }

    fn held_set_diagnostic(held: &[Held]) -> String {
        let mut s = String::new();
        for h in held {
            if !s.is_empty() {
                s.push_str(", ");
            }
            s.push_str(&format!(
                "{}({:?}){}",
                name_of(h.bit_no),
                h.pid,
                if h.trylocked { "*" } else { "" }
            ));
        }
        if s.is_empty() {
            s.push_str("<none>");
        }
        s
    }

    fn push_checked(held: &mut Vec<Held>, bit_no: u32, pid: Pid, trylocked: bool) {
        for h in held.iter() {
            if h.bit_no == bit_no && h.pid == pid {
                panic!(
                    "recursive acquisition of process lock {}({:?}); held: [{}]",
                    name_of(bit_no),
                    pid,
                    held_set_diagnostic(held)
                );
            }
            if !trylocked && !h.trylocked && (h.bit_no, h.pid) >= (bit_no, pid) {
                panic!(
                    "lock order violation acquiring {}({:?}) while holding {}({:?}); held: [{}]",
                    name_of(bit_no),
                    pid,
                    name_of(h.bit_no),
                    h.pid,
                    held_set_diagnostic(held)
                );
            }
        }
        held.push(Held {
            bit_no,
            pid,
            trylocked,
        });
    }

    #[track_caller]
    pub fn lc_lock(pid: Pid, locks: Locks) {
        HELD.with(|cell| {
            let mut held = cell.borrow_mut();
            for bit_no in 0..=MAX_LOCK_BIT {
                if locks.bits() & (1 << bit_no) != 0 {
                    push_checked(&mut held, bit_no, pid, false);
                }
            }
        });
    }

    #[track_caller]
    pub fn lc_trylock(pid: Pid, locks: Locks, locked: bool) {
        if !locked {
            return;
        }
        HELD.with(|cell| {
            let mut held = cell.borrow_mut();
            for bit_no in 0..=MAX_LOCK_BIT {
                if locks.bits() & (1 << bit_no) != 0 {
                    push_checked(&mut held, bit_no, pid, true);
                }
            }
        });
    }

    #[track_caller]
    pub fn lc_unlock(pid: Pid, locks: Locks) {
        HELD.with(|cell| {
            let mut held = cell.borrow_mut();
            // release in descending bit order, mirroring acquisition
            for bit_no in (0..=MAX_LOCK_BIT).rev() {
                if locks.bits() & (1 << bit_no) == 0 {
                    continue;
                }
                let pos = held
                    .iter()
                    .rposition(|h| h.bit_no == bit_no && h.pid == pid)
                    .unwrap_or_else(|| {
                        panic!(
                            "releasing process lock {}({:?}) that this thread does not hold; held: [{}]",
                            name_of(bit_no),
                            pid,
                            held_set_diagnostic(&held)
                        )
                    });
                held.remove(pos);
            }
        });
    }

    /// The set of this process's locks held by the calling thread.
    pub fn held_locks(pid: Pid) -> Locks {
        HELD.with(|cell| {
            let held = cell.borrow();
            let mut locks = Locks::empty();
            for h in held.iter() {
                if h.pid == pid {
                    locks |= Locks::from_bits_retain(1 << h.bit_no);
                }
            }
            locks
        })
    }
}

#[cfg(feature = "lock-check")]
pub use imp::*;

#[cfg(not(feature = "lock-check"))]
mod imp {
    use crate::proc_lock::Locks;
    use crate::table::Pid;

    #[inline(always)]
    pub fn lc_lock(_pid: Pid, _locks: Locks) {}
    #[inline(always)]
    pub fn lc_trylock(_pid: Pid, _locks: Locks, _locked: bool) {}
    #[inline(always)]
    pub fn lc_unlock(_pid: Pid, _locks: Locks) {}
}

#[cfg(not(feature = "lock-check"))]
pub use imp::*;

#[cfg(all(test, feature = "lock-check", not(loom)))]
mod tests {
    use super::*;
    use crate::proc_lock::Locks;
    use crate::table::Pid;

    fn catch<F: FnOnce() + Send + 'static>(f: F) -> bool {
        std::thread::spawn(f).join().is_err()
    }

    #[test]
    fn ascending_bits_pass() {
        let pid = Pid::from_raw(1);
        lc_lock(pid, Locks::MAIN);
        lc_lock(pid, Locks::STATUS);
        assert_eq!(held_locks(pid), Locks::MAIN | Locks::STATUS);
        lc_unlock(pid, Locks::MAIN | Locks::STATUS);
        assert!(held_locks(pid).is_empty());
    }

    #[test]
    fn descending_bits_abort() {
        assert!(catch(|| {
            let pid = Pid::from_raw(1);
            lc_lock(pid, Locks::STATUS);
            lc_lock(pid, Locks::MAIN);
        }));
    }

    #[test]
    fn same_bit_higher_pid_first_aborts() {
        assert!(catch(|| {
            lc_lock(Pid::from_raw(9), Locks::MAIN);
            lc_lock(Pid::from_raw(3), Locks::MAIN);
        }));
    }

    #[test]
    fn recursion_aborts() {
        assert!(catch(|| {
            let pid = Pid::from_raw(1);
            lc_lock(pid, Locks::MAIN);
            lc_lock(pid, Locks::MAIN);
        }));
    }

    #[test]
    fn trylock_out_of_order_is_legal() {
        let pid_hi = Pid::from_raw(60);
        let pid_lo = Pid::from_raw(50);
        lc_lock(pid_hi, Locks::STATUS);
        lc_trylock(pid_lo, Locks::MAIN, true);
        lc_unlock(pid_lo, Locks::MAIN);
        lc_unlock(pid_hi, Locks::STATUS);
    }

    #[test]
    fn releasing_unheld_aborts() {
        assert!(catch(|| {
            lc_unlock(Pid::from_raw(77), Locks::MSGQ);
        }));
    }
}
