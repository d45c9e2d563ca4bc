//! Multi-bit per-process locks.
//!
//! Each process carries one atomic flag word and one wait queue per lock
//! bit, packed as follows:
//! - `bits[4:0]` = lock bits (main, msgq, btm, status, trace)
//!     - 1 = locked
//! - `bits[20:16]` = waiter bits, paired with the lock bits
//!     - 1 = the corresponding wait queue is non-empty
//!
//! The word holds room for 16 lock/waiter pairs; five are exposed.
//!
//! Acquiring a set of locks first tries to set all the lock bits with one
//! atomic or. If the previous value shows neither a lock bit nor a waiter
//! bit for the requested set, the acquire is done. Otherwise the slow path
//! spins re-trying an in-order prefix of the set, and finally takes the
//! pix lock, sets the waiter bit of the lowest unavailable bit, enqueues
//! the thread's wait slot and sleeps on its event.
//!
//! Releasing clears, with one atomic op, every lock bit whose waiter bit
//! is clear. Bits with waiters are *transferred* instead: under the pix
//! lock the head waiter is dequeued and the bit stays set the whole time,
//! so the lock is never observably free while someone queues for it.
//! Within one bit, waiters are served in fifo order.
//!
//! Wait queues are circular doubly linked lists threaded through the
//! per-thread wait slots ([crate::tse]); `queue[ix]` points at the first
//! waiter and `queue[ix].prev` is the last.
//!
//! Multi-bit acquisition always walks bits in ascending order, and
//! [LockPool::safelock] extends that order across two processes (same bit
//! position: lower pid first), which is what makes the whole scheme
//! deadlock free.

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use tracing::Level;

use crate::lock_check;
use crate::loom_testing::*;
use crate::pix::PixPool;
use crate::table::Process;
use crate::thr_progress;
use crate::tse;
use crate::tse::WaitSlot;
use crate::util::UsizePtr;

/// Number of distinct lock bits per process
pub const NUM_LOCKS: usize = 5;
/// Highest lock bit position
pub const MAX_LOCK_BIT: u32 = 4;
/// Distance between a lock bit and its paired waiter bit
const WAITER_SHIFT: u32 = 16;

const _: () = assert!(NUM_LOCKS == MAX_LOCK_BIT as usize + 1);
const _: () = assert!(Locks::ALL.bits() < (1 << WAITER_SHIFT));

bitflags::bitflags! {
    /// A subset of the per-process lock bits.
    ///
    /// Bit positions double as the intra-process lock order: multi-bit
    /// acquisition proceeds from `MAIN` upwards.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Locks: u32 {
        /// Main lock: protects the bulk of the process state
        const MAIN = 1 << 0;
        /// Message queue lock
        const MSGQ = 1 << 1;
        /// Bookkeeping (timer) lock
        const BTM = 1 << 2;
        /// Status lock
        const STATUS = 1 << 3;
        /// Trace lock
        const TRACE = 1 << 4;
        /// Every lock bit
        const ALL = Self::MAIN.bits()
            | Self::MSGQ.bits()
            | Self::BTM.bits()
            | Self::STATUS.bits()
            | Self::TRACE.bits();
    }
}

impl std::fmt::Debug for Locks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let names = ["main", "msgq", "btm", "status", "trace"];
        let mut first = true;
        for (bit_no, name) in names.iter().enumerate() {
            if self.bits() & (1 << bit_no) != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The lock bit at position `bit_no`
const fn nth_lock(bit_no: u32) -> Locks {
    Locks::from_bits_retain(1 << bit_no)
}

/// Waiter bits paired with the given lock bits
const fn waiter_bits(locks: u32) -> u32 {
    locks << WAITER_SHIFT
}

/// Of `locks`, the ones whose waiter bit is set in `flags`, as lock bits
const fn waiters_of(flags: u32, locks: u32) -> u32 {
    (flags >> WAITER_SHIFT) & locks
}

/// Determine which of `need` are not currently locked in `in_use`, without
/// returning any lock above the lowest needed one that is in use, so that
/// callers never grab locks out of order.
///
/// For example, needing `10111` with `00100` in use yields `00011`:
/// `10000` must wait because taking it now would jump over `00100`.
const fn in_order_locks(in_use: u32, need: u32) -> u32 {
    // all locks we want that someone else holds
    let busy = in_use & need;
    // just the lowest of those; 0 if none
    let lowest_busy = busy & busy.wrapping_neg();
    need & lowest_busy.wrapping_sub(1)
}

/// Spin behavior of the contended acquisition path.
///
/// All values are tunables; the defaults match the calibration the engine
/// was designed with (spins scale with scheduler count, auxiliary threads
/// barely spin at all).
#[derive(Clone, Copy, Debug)]
pub struct SpinTuning {
    /// Base spin count for scheduler threads
    pub base: u32,
    /// Extra spins per registered scheduler
    pub sched_inc: u32,
    /// Spin count for auxiliary threads
    pub aux: u32,
    /// Upper bound on the scheduler spin count
    pub max: u32,
    /// A thread yield is interleaved every this many spins
    pub yield_stride: u32,
}

impl Default for SpinTuning {
    fn default() -> Self {
        Self {
            base: 1000,
            sched_inc: 32,
            aux: 50,
            max: 2000,
            yield_stride: 25,
        }
    }
}

/// Per-process lock state: the flag word plus one wait queue per bit.
pub struct ProcLock {
    pub(crate) flags: AtomicU32,
    /// Wait queue heads, one per lock bit.
    ///
    /// Only read or written while holding the pix lock of the owning
    /// process, which is what makes the interior mutability sound.
    queues: UnsafeCell<[Option<NonNull<WaitSlot>>; NUM_LOCKS]>,
    /// Per-bit holder counts (0 or 1), checked on every transition
    #[cfg(all(debug_assertions, not(loom)))]
    locked: [AtomicU32; NUM_LOCKS],
}

// safety: `queues` is guarded by the pix lock as described above; the
// raw waiter pointers it contains stay alive for as long as they are
// enqueued (see crate::tse::pin).
unsafe impl Send for ProcLock {}
unsafe impl Sync for ProcLock {}

impl ProcLock {
    pub(crate) fn new() -> Self {
        Self {
            flags: AtomicU32::new(0),
            queues: UnsafeCell::new([None; NUM_LOCKS]),
            #[cfg(all(debug_assertions, not(loom)))]
            locked: [
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
                AtomicU32::new(0),
            ],
        }
    }

    /// Reset to the freshly created state: every lock bit held (a process
    /// enters the world owned by its creator), all queues empty.
    ///
    /// Callers must guarantee nothing else references this lock yet.
    pub(crate) fn init(&self) {
        self.flags.store(Locks::ALL.bits(), Ordering::Relaxed);
        // safety: per the contract above we are the only accessor
        unsafe {
            *self.queues.get() = [None; NUM_LOCKS];
        }
        #[cfg(all(debug_assertions, not(loom)))]
        for l in &self.locked {
            l.store(1, Ordering::Relaxed);
        }
    }

    /// Tear-down check; the queues must have drained by now.
    pub(crate) fn fin(&self) {
        // safety: retirement has excluded all other accessors
        unsafe {
            let queues = &*self.queues.get();
            debug_assert!(queues.iter().all(|q| q.is_none()));
        }
        self.flags.store(0, Ordering::Relaxed);
        #[cfg(all(debug_assertions, not(loom)))]
        for l in &self.locked {
            l.store(0, Ordering::Relaxed);
        }
    }

    /// Whether the main lock is held and uncontended.
    pub(crate) fn main_is_exclusive(&self) -> bool {
        let flags = self.flags.load(Ordering::Relaxed);
        flags & Locks::MAIN.bits() != 0 && waiters_of(flags, Locks::MAIN.bits()) == 0
    }

    #[cfg(all(debug_assertions, not(loom)))]
    fn lock_op_debug(&self, locks: Locks, locked: bool) {
        for bit_no in 0..NUM_LOCKS {
            if locks.bits() & (1 << bit_no) == 0 {
                continue;
            }
            if locked {
                let prev = self.locked[bit_no].fetch_add(1, Ordering::Relaxed);
                debug_assert_eq!(prev, 0, "lock bit {bit_no} acquired while held");
            } else {
                let prev = self.locked[bit_no].fetch_sub(1, Ordering::Relaxed);
                debug_assert_eq!(prev, 1, "lock bit {bit_no} released while free");
            }
        }
    }
    #[cfg(not(all(debug_assertions, not(loom))))]
    fn lock_op_debug(&self, _locks: Locks, _locked: bool) {}

    /// All-or-nothing trylock on the flag word. Fails if any requested
    /// lock bit or any paired waiter bit is set; on failure the flag word
    /// is left exactly as found.
    fn raw_trylock(&self, locks: Locks) -> bool {
        let mut old = self.flags.load(Ordering::Relaxed);
        loop {
            if old & (locks.bits() | waiter_bits(locks.bits())) != 0 {
                return false;
            }
            match self.flags.compare_exchange_weak(
                old,
                old | locks.bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(x) => old = x,
            }
        }
    }

    /// Try to acquire as many of the waiter's needed locks as possible, in
    /// ascending bit order, and enqueue it on the first lock it cannot
    /// get.
    ///
    /// # Safety
    ///
    /// The pix lock of the owning process must be held: this manipulates
    /// wait queues and waiter bits. `wtr` must be pinned and not currently
    /// on any queue.
    unsafe fn try_acquire(&self, wtr: NonNull<WaitSlot>) {
        let locks = (*wtr.as_ref().q.get()).needed;
        let mut got = Locks::empty();
        debug_assert!(!locks.is_empty());

        for bit_no in 0..=MAX_LOCK_BIT {
            let lock = nth_lock(bit_no);
            if !locks.contains(lock) {
                continue;
            }
            let queue = &mut (*self.queues.get())[bit_no as usize];
            if queue.is_some() {
                // others already waiting for this one
                debug_assert!(
                    self.flags.load(Ordering::Relaxed) & waiter_bits(lock.bits()) != 0
                );
                enqueue_waiter(queue, wtr);
                break;
            }
            let wflg = waiter_bits(lock.bits());
            let old = self.flags.fetch_or(wflg | lock.bits(), Ordering::Acquire);
            if old & lock.bits() != 0 {
                // didn't get the lock; the or above set our waiter bit
                enqueue_waiter(queue, wtr);
                break;
            }
            // got the lock; no one else can be waiting for it, so the
            // waiter bit comes straight back out
            debug_assert!(old & wflg == 0);
            got |= lock;
            self.flags.fetch_and(!wflg, Ordering::Relaxed);
            if got == locks {
                break;
            }
        }

        self.lock_op_debug(got, true);
        (*wtr.as_ref().q.get()).needed &= !got;
    }

    /// Walk every queue and cross-check it against the waiter bits.
    ///
    /// # Safety
    ///
    /// Pix lock held.
    #[cfg(all(debug_assertions, not(loom)))]
    unsafe fn check_queues(&self) {
        let flags = self.flags.load(Ordering::Relaxed);
        let queues = &*self.queues.get();
        for bit_no in 0..NUM_LOCKS {
            let wflg = waiter_bits(1 << bit_no);
            if flags & wflg != 0 {
                let head = queues[bit_no].expect("waiter bit set with empty queue");
                let mut n = 0isize;
                let mut w = head;
                loop {
                    w = (*w.as_ref().q.get()).next.expect("unlinked queued waiter");
                    n += 1;
                    if w == head {
                        break;
                    }
                }
                loop {
                    w = (*w.as_ref().q.get()).prev.expect("unlinked queued waiter");
                    n -= 1;
                    if w == head {
                        break;
                    }
                }
                assert_eq!(n, 0, "wait queue links inconsistent");
            } else {
                assert!(queues[bit_no].is_none(), "queue populated without waiter bit");
            }
        }
    }
    #[cfg(not(all(debug_assertions, not(loom))))]
    unsafe fn check_queues(&self) {}

    /// Test hook: length of the wait queue for `bit_no`.
    ///
    /// # Safety
    ///
    /// Pix lock held.
    #[cfg(test)]
    pub(crate) unsafe fn queue_len(&self, bit_no: usize) -> usize {
        let queues = &*self.queues.get();
        let Some(head) = queues[bit_no] else {
            return 0;
        };
        let mut n = 0;
        let mut w = head;
        loop {
            n += 1;
            w = (*w.as_ref().q.get()).next.expect("unlinked queued waiter");
            if w == head {
                break;
            }
        }
        n
    }
}

/// Append `wtr` at the tail of the queue.
///
/// # Safety
///
/// Pix lock held; `wtr` not on any queue.
unsafe fn enqueue_waiter(queue: &mut Option<NonNull<WaitSlot>>, wtr: NonNull<WaitSlot>) {
    match *queue {
        None => {
            let q = &mut *wtr.as_ref().q.get();
            q.next = Some(wtr);
            q.prev = Some(wtr);
            *queue = Some(wtr);
        }
        Some(first) => {
            let last = (*first.as_ref().q.get()).prev.expect("queued without links");
            {
                let q = &mut *wtr.as_ref().q.get();
                q.next = Some(first);
                q.prev = Some(last);
            }
            (*last.as_ref().q.get()).next = Some(wtr);
            (*first.as_ref().q.get()).prev = Some(wtr);
        }
    }
}

/// Remove and return the head of the queue.
///
/// # Safety
///
/// Pix lock held; queue non-empty.
unsafe fn dequeue_waiter(queue: &mut Option<NonNull<WaitSlot>>) -> NonNull<WaitSlot> {
    let wtr = queue.expect("dequeue from empty wait queue");
    let (next, prev) = {
        let q = &mut *wtr.as_ref().q.get();
        let next = q.next.take().expect("queued without links");
        let prev = q.prev.take().expect("queued without links");
        (next, prev)
    };
    if next == wtr {
        *queue = None;
    } else {
        (*prev.as_ref().q.get()).next = Some(next);
        (*next.as_ref().q.get()).prev = Some(prev);
        *queue = Some(next);
    }
    wtr
}

/// Shared state of the lock engine: the pix lock pool plus the spin
/// calibration computed at construction time.
///
/// All lock operations go through one of these; the per-process state
/// lives in each process's [ProcLock].
pub struct LockPool {
    pix: PixPool,
    sched_spin_count: u32,
    aux_spin_count: u32,
    yield_stride: u32,
}

impl LockPool {
    /// Build a pool calibrated for `cpus` online CPUs and `schedulers`
    /// scheduler threads. `cpus == 0` means the CPU count is unknown;
    /// assume multiprocessing but stay conservative.
    pub fn new(cpus: usize, schedulers: usize) -> Self {
        Self::with_tuning(cpus, schedulers, SpinTuning::default())
    }

    pub fn with_tuning(cpus: usize, schedulers: usize, tuning: SpinTuning) -> Self {
        let full = tuning
            .base
            .saturating_add(tuning.sched_inc.saturating_mul(schedulers as u32))
            .min(tuning.max);
        let (sched_spin_count, aux_spin_count) = match cpus {
            1 => (0, 0),
            0 => (full / 2, tuning.aux / 2),
            _ => (full, tuning.aux),
        };
        #[cfg(loom)]
        let (sched_spin_count, aux_spin_count) = (1.min(sched_spin_count), 1.min(aux_spin_count));
        Self {
            pix: PixPool::new(),
            sched_spin_count,
            aux_spin_count,
            yield_stride: tuning.yield_stride.max(1),
        }
    }

    /// Initialize a process's lock state: created with every bit held by
    /// the calling thread.
    pub fn lock_init(&self, p: &Process) {
        p.lock.init();
        lock_check::lc_trylock(p.pid(), Locks::ALL, true);
    }

    /// Tear down a process's lock state.
    pub fn lock_fin(&self, p: &Process) {
        p.lock.fin();
    }

    /// Acquire `locks` on `p`, blocking until every requested bit is held.
    #[track_caller]
    pub fn lock(&self, p: &Process, locks: Locks) {
        debug_assert!(Locks::ALL.contains(locks));
        let tracing_span =
            tracing::span!(Level::TRACE, "LockPool::lock", pid = ?p.pid(), locks = ?locks);
        let _span_enter = tracing_span.enter();
        tracing::event!(name: "proc_lock::lock", Level::TRACE, "lock");

        lock_check::lc_lock(p.pid(), locks);

        let old = p.lock.flags.fetch_or(locks.bits(), Ordering::Acquire);
        if old & (locks.bits() | waiter_bits(locks.bits())) == 0 {
            // uncontended: all bits were clear and nobody queued
            p.lock.lock_op_debug(locks, true);
            return;
        }
        self.lock_failed(p, locks, old);
        debug_assert_eq!(
            p.lock.flags.load(Ordering::Relaxed) & locks.bits(),
            locks.bits()
        );
    }

    /// Try to acquire `locks` on `p` without blocking.
    ///
    /// Returns the acquired set: all of `locks`, or the empty set if any
    /// requested bit was held or had waiters. Failure leaves the flag
    /// word untouched.
    pub fn trylock(&self, p: &Process, locks: Locks) -> Locks {
        debug_assert!(Locks::ALL.contains(locks));
        let ok = p.lock.raw_trylock(locks);
        lock_check::lc_trylock(p.pid(), locks, ok);
        if ok {
            p.lock.lock_op_debug(locks, true);
            locks
        } else {
            Locks::empty()
        }
    }

    /// Release `locks` on `p`. Bits with queued waiters are handed to the
    /// head waiter instead of being cleared. Never blocks.
    #[track_caller]
    pub fn unlock(&self, p: &Process, locks: Locks) {
        debug_assert!(Locks::ALL.contains(locks));
        let tracing_span =
            tracing::span!(Level::TRACE, "LockPool::unlock", pid = ?p.pid(), locks = ?locks);
        let _span_enter = tracing_span.enter();
        tracing::event!(name: "proc_lock::unlock", Level::TRACE, "unlock");

        lock_check::lc_unlock(p.pid(), locks);
        self.unlock_raw(p, locks);
    }

    fn unlock_raw(&self, p: &Process, locks: Locks) {
        let mut old = p.lock.flags.load(Ordering::Relaxed);
        loop {
            debug_assert_eq!(old & locks.bits(), locks.bits(), "releasing unheld lock");
            let wait_locks = waiters_of(old, locks.bits());
            let clearable = locks.bits() & !wait_locks;
            // ordering: pushes out the protected writes before the bits
            // become grabbable again
            match p.lock.flags.compare_exchange(
                old,
                old & !clearable,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    p.lock.lock_op_debug(Locks::from_bits_retain(clearable), false);
                    if wait_locks != 0 {
                        self.transfer_locks(p, Locks::from_bits_retain(wait_locks));
                    }
                    return;
                }
                Err(x) => old = x,
            }
        }
    }

    /// The slow half of [Self::lock], entered when the fast-path or
    /// observed a requested bit already set (held by someone else) or a
    /// waiter bit somewhere in the requested set.
    #[cold]
    fn lock_failed(&self, p: &Process, locks: Locks, old: u32) {
        let won = locks.bits() & !old;
        let need = locks.bits() & old;

        p.lock.lock_op_debug(Locks::from_bits_retain(won), true);

        // Retract winnings at or above the lowest busy bit: waiting on a
        // bit while holding a higher one would break the lock order. The
        // retracted bits go back through the full release protocol since
        // waiters may already have queued on them.
        let lowest_busy = need & need.wrapping_neg();
        let keep = won & lowest_busy.wrapping_sub(1);
        let retract = won & !lowest_busy.wrapping_sub(1);
        if retract != 0 {
            self.unlock_raw(p, Locks::from_bits_retain(retract));
        }

        let mut need_locks = locks.bits() & !keep;
        if need_locks == 0 {
            return;
        }

        let spin_count_max = if thr_progress::is_scheduler() {
            self.sched_spin_count
        } else {
            self.aux_spin_count
        };
        let mut spin_count = spin_count_max;
        let mut until_yield = self.yield_stride;
        let mut olflgs = p.lock.flags.load(Ordering::Relaxed);

        while need_locks != 0 {
            let can_grab = in_order_locks(olflgs, need_locks);

            if can_grab == 0 {
                // someone already has the lowest-numbered lock we want
                if spin_count == 0 {
                    // too many retries; sleep for the locks
                    self.wait_for_locks(p, Locks::from_bits_retain(need_locks));
                    return;
                }
                spin_count -= 1;

                spin_hint();
                until_yield -= 1;
                if until_yield == 0 {
                    until_yield = self.yield_stride;
                    thread_yield();
                }

                olflgs = p.lock.flags.load(Ordering::Relaxed);
            } else {
                // grab all of the grabbable locks at once
                let grabbed = olflgs | can_grab;
                match p.lock.flags.compare_exchange(
                    olflgs,
                    grabbed,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        p.lock.lock_op_debug(Locks::from_bits_retain(can_grab), true);
                        olflgs = grabbed;
                        need_locks &= !can_grab;
                        // progress was made, reset the spin budget
                        spin_count = spin_count_max;
                    }
                    Err(x) => olflgs = x,
                }
            }
        }
    }

    /// Enqueue the calling thread for `need` and sleep until every bit
    /// has been transferred to it.
    #[cold]
    fn wait_for_locks(&self, p: &Process, need: Locks) {
        let wtr = tse::fetch();
        // safety: the slot is idle, nothing else references it yet
        unsafe {
            (*wtr.q.get()).needed = need;
        }
        let wtr_ptr = NonNull::from(&*wtr);

        tracing::event!(
            name: "proc_lock::park",
            Level::TRACE,
            pid = ?p.pid(),
            needed = ?need,
            wtr = ?UsizePtr::from(wtr_ptr.as_ptr())
        );

        let enqueued = {
            let _pix = self.pix.lock_for(p.pid());
            // safety: pix lock held, slot idle
            unsafe {
                p.lock.check_queues();
                p.lock.try_acquire(wtr_ptr);
                p.lock.check_queues();
            }
            let still_needed = unsafe { (*wtr.q.get()).needed };
            if still_needed.is_empty() {
                false
            } else {
                wtr.waiting.store(1, Ordering::Relaxed);
                // the queue keeps the slot alive until the final wakeup
                tse::pin(&wtr);
                true
            }
            // pix guard drops here, before any sleeping
        };

        if enqueued {
            loop {
                wtr.event.reset();
                // acquire pairs with the releasing store in unpin_wake,
                // making the granted bits' protected state visible
                if wtr.waiting.load(Ordering::Acquire) == 0 {
                    break;
                }
                // Wait for the needed locks to be acquired by other
                // threads and transferred to us. Spurious wakeups are
                // fine, the flag re-check above decides.
                wtr.event.wait();
            }
            debug_assert!(unsafe { (*wtr.q.get()).needed }.is_empty());
        }

        debug_assert_eq!(
            p.lock.flags.load(Ordering::Relaxed) & need.bits(),
            need.bits()
        );
        tse::give_back(wtr);
    }

    /// Hand `transfer` (bits this thread holds that have queued waiters)
    /// over to the head waiter of each queue, then wake every waiter whose
    /// needed set drained.
    #[cold]
    fn transfer_locks(&self, p: &Process, transfer: Locks) {
        let mut wake: [Option<NonNull<WaitSlot>>; NUM_LOCKS] = [None; NUM_LOCKS];
        let mut nwake = 0;
        let mut unset_waiter = 0u32;
        let mut transferred = 0usize;

        {
            let _pix = self.pix.lock_for(p.pid());
            // safety for this block: pix lock held
            unsafe {
                p.lock.check_queues();

                for bit_no in 0..=MAX_LOCK_BIT {
                    let lock = nth_lock(bit_no);
                    if !transfer.contains(lock) {
                        continue;
                    }
                    debug_assert!(
                        p.lock.flags.load(Ordering::Relaxed) & waiter_bits(lock.bits()) != 0
                    );
                    transferred += 1;

                    let wtr = {
                        let queue = &mut (*p.lock.queues.get())[bit_no as usize];
                        let wtr = dequeue_waiter(queue);
                        if queue.is_none() {
                            unset_waiter |= waiter_bits(lock.bits());
                        }
                        wtr
                    };

                    let needed_left = {
                        let q = &mut *wtr.as_ref().q.get();
                        debug_assert!(q.needed.contains(lock));
                        q.needed &= !lock;
                        q.needed
                    };
                    if !needed_left.is_empty() {
                        // act on the waiter's behalf for the rest of its
                        // set; this may re-enqueue it on a higher bit
                        p.lock.try_acquire(wtr);
                    }
                    if (*wtr.as_ref().q.get()).needed.is_empty() {
                        // the waiter has everything it asked for
                        wake[nwake] = Some(wtr);
                        nwake += 1;
                    }
                }

                if unset_waiter != 0 {
                    p.lock.flags.fetch_and(!unset_waiter, Ordering::Relaxed);
                }

                p.lock.check_queues();
            }
            // pix guard drops here
        }

        debug_assert!(transferred > 0);

        // Waking after the pix lock is released keeps the critical section
        // short and spares the woken threads an immediate collision with
        // it.
        for w in wake.iter().take(nwake) {
            let w = w.expect("wake list slot unset");
            tracing::event!(
                name: "proc_lock::wake",
                Level::TRACE,
                pid = ?p.pid(),
                wtr = ?UsizePtr::from(w.as_ptr())
            );
            // safety: the slot was pinned when it was first enqueued and
            // is now off every queue with an empty needed set
            unsafe {
                tse::unpin_wake(w);
            }
        }
    }

    /// Lock locks on two processes without deadlocking, releasing held
    /// locks that sit outside the global lock order and reacquiring
    /// everything in order.
    ///
    /// `a_have`/`b_have` are the locks already held on each process and
    /// must be subsets of the respective needed sets (safelock never ends
    /// up releasing a lock its caller wants kept). On return exactly
    /// `a_need` is held on `a` and `b_need` on `b`.
    ///
    /// The global order is: ascending bit position, and for the same bit
    /// position the lower pid first.
    #[track_caller]
    pub fn safelock(
        &self,
        a: Option<&Process>,
        a_have: Locks,
        a_need: Locks,
        b: &Process,
        b_have: Locks,
        b_need: Locks,
    ) {
        self.proc_safelock(
            thr_progress::is_scheduler(),
            a,
            a_have,
            a_need,
            b,
            b_have,
            b_need,
        );
    }

    pub(crate) fn proc_safelock(
        &self,
        is_managed: bool,
        a: Option<&Process>,
        a_have: Locks,
        a_need: Locks,
        b: &Process,
        b_have: Locks,
        b_need: Locks,
    ) {
        let tracing_span = tracing::span!(
            Level::TRACE,
            "LockPool::safelock",
            a = ?a.map(|p| p.pid()),
            b = ?b.pid()
        );
        let _span_enter = tracing_span.enter();

        assert!(
            a_need.contains(a_have) && b_need.contains(b_have),
            "safelock cannot be used to release locks"
        );

        // Determine the inter-process order: for equal bit positions, the
        // lower pid is locked first. The same process on both sides
        // collapses into one.
        let (p1, mut have1, mut need1, p2, mut have2, mut need2) = match a {
            Some(a) if a.pid() < b.pid() => (a, a_have, a_need, Some(b), b_have, b_need),
            Some(a) if a.pid() > b.pid() => (b, b_have, b_need, Some(a), a_have, a_need),
            Some(a) => (
                a,
                a_have | b_have,
                a_need | b_need,
                None,
                Locks::empty(),
                Locks::empty(),
            ),
            None => (b, b_have, b_need, None, Locks::empty(), Locks::empty()),
        };

        need1 &= !have1;
        need2 &= !have2;

        // Figure out the range of locks that needs to be unlocked: the
        // ascending prefix up to the first bit needed on either process.
        // A bit needed only on p2 stays held on p1, holding the same bit
        // on the lower pid while taking it on the higher one is in order.
        let mut unlock_mask = Locks::ALL;
        let mut lock_no: u32 = 0;
        while lock_no <= MAX_LOCK_BIT {
            let lock = nth_lock(lock_no);
            if need1.contains(lock) {
                break;
            }
            unlock_mask &= !lock;
            if need2.contains(lock) {
                break;
            }
            lock_no += 1;
        }

        // ... and unlock the held locks in that range
        let mut refc1 = false;
        let mut refc2 = false;
        if !have1.is_empty() || !have2.is_empty() {
            let unlock_locks = unlock_mask & have1;
            if !unlock_locks.is_empty() {
                have1 &= !unlock_locks;
                need1 |= unlock_locks;
                if !is_managed && have1.is_empty() {
                    // completely unlocked for a while; pin it
                    refc1 = true;
                    p1.inc_refc();
                }
                self.unlock(p1, unlock_locks);
            }
            if let Some(p2) = p2 {
                let unlock_locks = unlock_mask & have2;
                if !unlock_locks.is_empty() {
                    have2 &= !unlock_locks;
                    need2 |= unlock_locks;
                    if !is_managed && have2.is_empty() {
                        refc2 = true;
                        p2.inc_refc();
                    }
                    self.unlock(p2, unlock_locks);
                }
            }
        }

        // `lock_no` is now the first bit to lock on either process. Lock
        // in ascending order, batching runs of bits that stay on one
        // process; a bit needed on both goes to p1 first.
        while lock_no <= MAX_LOCK_BIT {
            let mut lock = nth_lock(lock_no);
            let mut lock_mask = Locks::empty();
            if need1.contains(lock) {
                loop {
                    lock = nth_lock(lock_no);
                    lock_no += 1;
                    lock_mask |= lock;
                    if lock_no > MAX_LOCK_BIT || need2.contains(lock) {
                        break;
                    }
                }
                if need2.contains(lock) {
                    lock_no -= 1;
                }
                let locks = need1 & lock_mask;
                self.lock(p1, locks);
                have1 |= locks;
                need1 &= !locks;
            } else if need2.contains(lock) {
                while lock_no <= MAX_LOCK_BIT && !need1.contains(lock) {
                    lock_mask |= lock;
                    lock_no += 1;
                    if lock_no > MAX_LOCK_BIT {
                        break;
                    }
                    lock = nth_lock(lock_no);
                }
                let locks = need2 & lock_mask;
                // p2 exists whenever need2 is non-empty
                let p2 = p2.expect("needed locks on a collapsed process");
                self.lock(p2, locks);
                have2 |= locks;
                need2 &= !locks;
            } else {
                lock_no += 1;
            }
        }

        debug_assert!(need1.is_empty() && need2.is_empty());

        if !is_managed {
            if refc1 {
                p1.dec_refc();
            }
            if refc2 {
                p2.expect("pinned a collapsed process").dec_refc();
            }
        }
    }
}

#[cfg(test)]
mod tests;
