//! Thread-fleet stress driver for the proclock engine.
//!
//! Spawns a table of processes and a fleet of worker threads that hammer
//! them with random lock/unlock, try-lock, safelock and lookup traffic,
//! then checks that every lock drained. Usage:
//!
//! ```text
//! proclock_stress [threads] [procs] [iters]
//! ```
//!
//! Set `RUST_LOG=proclock=trace` to watch the engine work.

use std::time::Instant;

use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use proclock::thr_progress::register_scheduler;
use proclock::{Lookup, LookupFlags, Locks, ProcTable};

fn arg(n: usize, default: usize) -> usize {
    std::env::args()
        .nth(n)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn random_locks(rng: &mut impl Rng) -> Locks {
    Locks::from_bits_truncate(rng.gen_range(1u32..32))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let threads = arg(1, 4);
    let procs = arg(2, 8);
    let iters = arg(3, 50_000);

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(0);
    let table = ProcTable::new(64, cpus, threads);

    let mut pids = Vec::with_capacity(procs);
    for _ in 0..procs {
        let p = table.spawn(None).expect("table full");
        table.locks().unlock(p, Locks::ALL);
        pids.push(p.pid());
    }
    info!(threads, procs, iters, cpus, "starting stress run");

    let started = Instant::now();
    let mut completed = vec![0u64; threads];

    std::thread::scope(|s| {
        for (tid, slot) in completed.iter_mut().enumerate() {
            let table = &table;
            let pids = &pids;
            s.spawn(move || {
                // half the fleet runs with the scheduler spin budget
                if tid % 2 == 0 {
                    register_scheduler();
                }
                proclock::prepare_waiter();

                let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed ^ tid as u64);
                let mut done = 0u64;
                for _ in 0..iters {
                    let pid = pids[rng.gen_range(0..pids.len())];
                    match rng.gen_range(0u32..10) {
                        // plain blocking lock through the table
                        0..=5 => {
                            let locks = random_locks(&mut rng);
                            match table.lookup_and_lock(None, pid, locks, LookupFlags::empty()) {
                                Lookup::Locked(p) => {
                                    table.locks().unlock(p, locks);
                                    done += 1;
                                }
                                Lookup::Busy => unreachable!("busy without TRY_LOCK"),
                                Lookup::NotFound => {}
                            }
                        }
                        // try-lock; contention is an expected outcome
                        6..=7 => {
                            let locks = random_locks(&mut rng);
                            match table.lookup_and_lock(None, pid, locks, LookupFlags::TRY_LOCK) {
                                Lookup::Locked(p) => {
                                    table.locks().unlock(p, locks);
                                    done += 1;
                                }
                                Lookup::Busy | Lookup::NotFound => {}
                            }
                        }
                        // two-process safelock
                        8 => {
                            let other = pids[rng.gen_range(0..pids.len())];
                            if other == pid {
                                continue;
                            }
                            let Lookup::Locked(a) = table.lookup_and_lock(
                                None,
                                pid,
                                Locks::STATUS,
                                LookupFlags::empty(),
                            ) else {
                                continue;
                            };
                            let Lookup::Locked(b) = table.lookup_and_lock(
                                None,
                                other,
                                Locks::empty(),
                                LookupFlags::empty(),
                            ) else {
                                table.locks().unlock(a, Locks::STATUS);
                                continue;
                            };
                            table.locks().safelock(
                                Some(a),
                                Locks::STATUS,
                                Locks::MAIN | Locks::STATUS,
                                b,
                                Locks::empty(),
                                Locks::MAIN | Locks::MSGQ,
                            );
                            table.locks().unlock(a, Locks::MAIN | Locks::STATUS);
                            table.locks().unlock(b, Locks::MAIN | Locks::MSGQ);
                            done += 1;
                        }
                        // reference-counted peeks
                        _ => {
                            if let Some(p) = table.lookup_inc_refc(pid) {
                                let _ = p.main_lock_is_exclusive();
                                p.dec_refc();
                                done += 1;
                            }
                        }
                    }
                }
                *slot = done;
            });
        }
    });

    let elapsed = started.elapsed();

    // every lock must have drained: grabbing the full set may not block
    for pid in &pids {
        match table.lookup_and_lock(None, *pid, Locks::ALL, LookupFlags::TRY_LOCK) {
            Lookup::Locked(p) => table.locks().unlock(p, Locks::ALL),
            other => panic!("locks leaked on {pid:?}: {other:?}"),
        }
    }

    let total: u64 = completed.iter().sum();
    info!(
        total_ops = total,
        elapsed_ms = elapsed.as_millis() as u64,
        ops_per_sec = (total as f64 / elapsed.as_secs_f64()) as u64,
        "stress run clean"
    );
}
