//! The process table.
//!
//! A fixed array of process slots. A pid packs the slot index, a serial
//! number, and a node tag:
//! - `bits[15:0]` = slot index
//! - `bits[55:16]` = serial, bumped every time the slot is reused
//! - `bits[63:56]` = node, 0 for local pids
//!
//! Slot memory is owned by the table and never deallocated while the
//! table lives, so a stale `&Process` can never fault; the serial in the
//! pid is what makes stale handles *miss* (the lookup compares the full
//! pid). This is the same stance the flag word takes towards its own
//! payload: detection over prevention, with recycling deferred until
//! reference count zero plus unmanaged quiescence.
//!
//! Slot states: free -> claimed -> live (exiting is a live sub-state)
//! -> retiring -> free.

use std::fmt;

use tracing::Level;

use crate::loom_testing::*;
use crate::proc_lock::{LockPool, Locks, ProcLock};
use crate::thr_progress::ThrProgress;

const PID_INDEX_BITS: u32 = 16;
const PID_SERIAL_BITS: u32 = 40;
const PID_INDEX_MASK: u64 = (1 << PID_INDEX_BITS) - 1;
const PID_SERIAL_MASK: u64 = (1 << PID_SERIAL_BITS) - 1;

/// Process identifier. Total order on pids (derived) is what the global
/// lock order uses to rank processes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u64);

impl Pid {
    /// Distinguished "no process" value, also the parent of unattached
    /// processes. Not a local pid.
    pub const UNDEFINED: Pid = Pid(u64::MAX);

    pub(crate) fn new_local(index: usize, serial: u64) -> Pid {
        debug_assert!(index as u64 <= PID_INDEX_MASK);
        Pid((index as u64) | ((serial & PID_SERIAL_MASK) << PID_INDEX_BITS))
    }

    /// Whether the pid names a process on this node.
    pub const fn is_local(self) -> bool {
        self.0 >> (PID_INDEX_BITS + PID_SERIAL_BITS) == 0
    }

    pub(crate) const fn index(self) -> usize {
        (self.0 & PID_INDEX_MASK) as usize
    }

    const fn serial(self) -> u64 {
        (self.0 >> PID_INDEX_BITS) & PID_SERIAL_MASK
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn from_raw(raw: u64) -> Pid {
        Pid(raw)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Pid::UNDEFINED {
            write!(f, "<undefined>")
        } else if !self.is_local() {
            write!(f, "<ext:{:#x}>", self.0)
        } else {
            write!(f, "<{}.{}>", self.index(), self.serial())
        }
    }
}

// Slot / process states
const ST_LIVE: u32 = 1 << 0;
const ST_EXITING: u32 = 1 << 1;
const ST_CLAIMED: u32 = 1 << 2;
const ST_RETIRING: u32 = 1 << 3;

/// A process: a table slot with identity, reference count, lifecycle
/// state and the multi-bit lock guarding its (external) state.
pub struct Process {
    pid: AtomicU64,
    parent: AtomicU64,
    serial: AtomicU64,
    state: AtomicU32,
    refc: AtomicU32,
    pub(crate) lock: ProcLock,
}

impl Process {
    fn empty() -> Self {
        Self {
            pid: AtomicU64::new(Pid::UNDEFINED.raw()),
            parent: AtomicU64::new(Pid::UNDEFINED.raw()),
            serial: AtomicU64::new(0),
            state: AtomicU32::new(0),
            refc: AtomicU32::new(0),
            lock: ProcLock::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid.load(Ordering::Relaxed))
    }

    /// Parent pid, or `None` for unattached processes.
    pub fn parent(&self) -> Option<Pid> {
        let raw = self.parent.load(Ordering::Relaxed);
        if raw == Pid::UNDEFINED.raw() {
            None
        } else {
            Some(Pid::from_raw(raw))
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.state.load(Ordering::Acquire) & ST_EXITING != 0
    }

    /// Flag the process as exiting. Part of the teardown protocol; the
    /// caller serializes this through the status lock.
    pub fn mark_exiting(&self) {
        self.state.fetch_or(ST_EXITING, Ordering::Release);
    }

    /// Whether the main lock is held with no queued waiters.
    pub fn main_lock_is_exclusive(&self) -> bool {
        self.lock.main_is_exclusive()
    }

    pub fn inc_refc(&self) {
        let old = self.refc.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old > 0, "reference taken on a recycled slot");
    }

    /// Drop one reference. The last reference out recycles the slot.
    pub fn dec_refc(&self) {
        let old = self.refc.fetch_sub(1, Ordering::Release);
        debug_assert!(old >= 1, "reference count underflow");
        if old == 1 {
            fence(Ordering::Acquire);
            let st = self.state.load(Ordering::Relaxed);
            assert!(
                st & ST_RETIRING != 0,
                "reference count hit zero on a live process"
            );
            self.lock.fin();
            self.pid.store(Pid::UNDEFINED.raw(), Ordering::Relaxed);
            // slot is reusable from here
            self.state.store(0, Ordering::Release);
        }
    }

    #[cfg(test)]
    pub(crate) fn refc_for_test(&self) -> u32 {
        self.refc.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid())
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("refc", &self.refc.load(Ordering::Relaxed))
            .finish()
    }
}

bitflags::bitflags! {
    /// Behavior flags for [ProcTable::lookup_and_lock].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct LookupFlags: u32 {
        /// Return exiting processes instead of treating them as gone
        const ALLOW_EXITING = 1 << 0;
        /// Never block; report contention as [Lookup::Busy]
        const TRY_LOCK = 1 << 1;
        /// Also take a reference on the returned process
        const INC_REFC = 1 << 2;
    }
}

/// Outcome of [ProcTable::lookup_and_lock].
pub enum Lookup<'a> {
    /// No such process (unknown, non-local, exited, or stale pid)
    NotFound,
    /// `TRY_LOCK` was passed and some requested lock was contended
    Busy,
    /// The process, with every requested lock held
    Locked(&'a Process),
}

impl fmt::Debug for Lookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::NotFound => write!(f, "NotFound"),
            Lookup::Busy => write!(f, "Busy"),
            Lookup::Locked(p) => write!(f, "Locked({:?})", p.pid()),
        }
    }
}

/// The process table: slots, the lock engine, and the quiescence
/// machinery that lets slots recycle safely.
pub struct ProcTable {
    slots: Box<[Process]>,
    locks: LockPool,
    progress: ThrProgress,
    spawn_hint: AtomicUsize,
}

impl ProcTable {
    /// `capacity` must be a power of two, at most `1 << 16`.
    pub fn new(capacity: usize, cpus: usize, schedulers: usize) -> Self {
        assert!(capacity.is_power_of_two() && capacity as u64 <= PID_INDEX_MASK + 1);
        Self {
            slots: (0..capacity).map(|_| Process::empty()).collect(),
            locks: LockPool::new(cpus, schedulers),
            progress: ThrProgress::new(),
            spawn_hint: AtomicUsize::new(0),
        }
    }

    pub fn locks(&self) -> &LockPool {
        &self.locks
    }

    pub fn progress(&self) -> &ThrProgress {
        &self.progress
    }

    /// Create a process. It is returned with *every* lock bit held by the
    /// calling thread; release them once initialization is done.
    ///
    /// Returns `None` when the table is full.
    pub fn spawn(&self, parent: Option<Pid>) -> Option<&Process> {
        let n = self.slots.len();
        let start = self.spawn_hint.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let ix = (start + i) & (n - 1);
            let slot = &self.slots[ix];
            if slot
                .state
                .compare_exchange(0, ST_CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            debug_assert_eq!(slot.refc.load(Ordering::Relaxed), 0);
            let serial = slot.serial.fetch_add(1, Ordering::Relaxed) + 1;
            let pid = Pid::new_local(ix, serial);
            slot.pid.store(pid.raw(), Ordering::Relaxed);
            slot.parent
                .store(parent.unwrap_or(Pid::UNDEFINED).raw(), Ordering::Relaxed);
            // the table's own reference
            slot.refc.store(1, Ordering::Relaxed);
            self.locks.lock_init(slot);
            tracing::event!(name: "table::spawn", Level::TRACE, pid = ?pid);
            slot.state.store(ST_LIVE, Ordering::Release);
            return Some(slot);
        }
        None
    }

    /// Unpublish `p`: lookups miss from here on, and the slot recycles
    /// once the last reference drops.
    ///
    /// Callers drive the exit protocol first: mark the process exiting,
    /// then acquire and release all of its locks so the wait queues
    /// drain. Must not be called inside an unmanaged-delay section.
    pub fn remove(&self, p: &Process) {
        tracing::event!(name: "table::remove", Level::TRACE, pid = ?p.pid());
        let prev = p.state.fetch_or(ST_RETIRING, Ordering::SeqCst);
        assert!(prev & ST_LIVE != 0, "removing a process that is not live");
        debug_assert!(prev & ST_RETIRING == 0, "process removed twice");
        // Wait out every thread that loaded the slot before the retire
        // mark: by the time this returns they have either pinned the
        // process (keeping the slot) or lost interest.
        self.progress.wait_unmanaged_quiescence();
        p.dec_refc();
    }

    fn slot_load(&self, pid: Pid) -> Option<&Process> {
        let slot = self.slots.get(pid.index())?;
        let st = slot.state.load(Ordering::Acquire);
        if st & ST_LIVE == 0 || st & ST_RETIRING != 0 {
            return None;
        }
        if slot.pid.load(Ordering::Relaxed) != pid.raw() {
            return None;
        }
        Some(slot)
    }

    /// Resolve `pid` and acquire `locks` on the process in one operation.
    ///
    /// `caller` is the calling thread's own process (if any) together
    /// with the locks it already holds on it; it is what keeps the global
    /// lock order intact when the lookup has to fall back to a blocking
    /// reorder, and it enables the shortcut when `pid` is the caller's
    /// own pid.
    #[track_caller]
    pub fn lookup_and_lock<'t>(
        &'t self,
        caller: Option<(&'t Process, Locks)>,
        pid: Pid,
        locks: Locks,
        flags: LookupFlags,
    ) -> Lookup<'t> {
        let tracing_span = tracing::span!(
            Level::TRACE,
            "ProcTable::lookup_and_lock",
            pid = ?pid,
            locks = ?locks,
            flags = ?flags
        );
        let _span_enter = tracing_span.enter();

        if !pid.is_local() {
            return Lookup::NotFound;
        }
        debug_assert!(Locks::ALL.contains(locks));
        let mut need_locks = locks;

        if let Some((c_p, c_have)) = caller {
            if c_p.pid() == pid {
                if !flags.contains(LookupFlags::ALLOW_EXITING) && c_p.is_exiting() {
                    return Lookup::NotFound;
                }
                need_locks &= !c_have;
                if need_locks.is_empty() {
                    if flags.contains(LookupFlags::INC_REFC) {
                        c_p.inc_refc();
                    }
                    return Lookup::Locked(c_p);
                }
            }
        }

        let dhndl = self.progress.unmanaged_delay();

        let Some(proc) = self.slot_load(pid) else {
            drop(dhndl);
            return Lookup::NotFound;
        };

        if need_locks.is_empty() {
            if flags.contains(LookupFlags::INC_REFC) {
                proc.inc_refc();
            }
            drop(dhndl);
            return Lookup::Locked(proc);
        }

        // quick trylock grabbing the whole set at once
        let busy = self.locks.trylock(proc, need_locks).is_empty();

        let mut pinned = false;
        if busy {
            if flags.contains(LookupFlags::TRY_LOCK) {
                drop(dhndl);
                return Lookup::Busy;
            }
            // Pin the process across the blocking reorder, and end the
            // delay section before sleeping.
            proc.inc_refc();
            pinned = true;
            drop(dhndl);

            let (c_p, c_have) = match caller {
                Some((c_p, c_have)) => (Some(c_p), c_have),
                None => (None, Locks::empty()),
            };
            self.locks
                .proc_safelock(false, c_p, c_have, c_have, proc, Locks::empty(), need_locks);
        } else {
            drop(dhndl);
        }

        // Locks held; make sure the process is still the one asked for.
        let still_valid = if flags.contains(LookupFlags::ALLOW_EXITING) {
            // must still be live at its slot
            self.slot_load(pid).is_some_and(|q| std::ptr::eq(q, proc))
        } else {
            !proc.is_exiting()
        };

        if !still_valid {
            self.locks.unlock(proc, need_locks);
            if pinned {
                proc.dec_refc();
            }
            return Lookup::NotFound;
        }

        if flags.contains(LookupFlags::INC_REFC) {
            proc.inc_refc();
        }
        if pinned {
            proc.dec_refc();
        }
        Lookup::Locked(proc)
    }

    /// Resolve `pid` and take a reference, without locking anything.
    /// Exiting processes miss.
    pub fn lookup_inc_refc(&self, pid: Pid) -> Option<&Process> {
        self.lookup_inc_refc_opt(pid, false)
    }

    /// Like [Self::lookup_inc_refc] but exiting processes are returned.
    pub fn lookup_raw_inc_refc(&self, pid: Pid) -> Option<&Process> {
        self.lookup_inc_refc_opt(pid, true)
    }

    fn lookup_inc_refc_opt(&self, pid: Pid, allow_exiting: bool) -> Option<&Process> {
        if !pid.is_local() {
            return None;
        }
        let _dhndl = self.progress.unmanaged_delay();
        let proc = self.slot_load(pid)?;
        if !allow_exiting && proc.is_exiting() {
            return None;
        }
        proc.inc_refc();
        Some(proc)
    }
}
