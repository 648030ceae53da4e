//! The seam to the scheduler, and the blocking primitives built on it.
//!
//! The run queues, context switching and per-CPU bookkeeping belong to the
//! platform; it installs a [`SchedOps`] at boot. Everything here (wait
//! queues, condition variables, the futex table, the work queues) blocks
//! by parking the current thread through that hook and never spins while
//! holding a lock across a suspension.

pub mod condvar;
pub mod futex;
pub mod wait_queue;
pub mod work_queue;

use spin::Once;

use crate::time;

/// Thread ID, a unique identifier for a thread.
pub type Tid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Woken,
    TimedOut,
}

/// Scheduler operations the core calls out to.
///
/// `park_current`/`resume` carry a wake token: a `resume` delivered before
/// the target parks makes that park return immediately. Parks may also
/// return spuriously; every caller in this crate re-checks its predicate.
pub trait SchedOps: Sync {
    fn current(&self) -> Tid;

    /// Block the calling thread until [`Self::resume`] or `deadline`
    /// (uptime milliseconds) if one is given.
    fn park_current(&self, deadline_ms: Option<u64>) -> WakeReason;

    /// Deliver a wake token to `tid`.
    fn resume(&self, tid: Tid);

    fn yield_now(&self);

    fn cpu_count(&self) -> usize;

    /// Index of the CPU the caller runs on; stable only while preemption
    /// or interrupts are off, which is the case at its call sites.
    fn current_cpu(&self) -> usize;
}

static SCHED: Once<&'static dyn SchedOps> = Once::new();

pub fn init_sched(ops: &'static dyn SchedOps) {
    SCHED.call_once(|| ops);
}

pub(crate) fn sched() -> &'static dyn SchedOps {
    *SCHED
        .get()
        .expect("thread primitives used before the platform installed SchedOps")
}

pub fn current_tid() -> Tid {
    sched().current()
}

pub fn cpu_count() -> usize {
    SCHED.get().map_or(1, |s| s.cpu_count())
}

pub fn current_cpu() -> usize {
    SCHED.get().map_or(0, |s| s.current_cpu())
}

/// Yields the CPU; usable before the scheduler exists (busy boot paths),
/// where it degrades to a spin hint.
pub fn yield_now() {
    match SCHED.get() {
        Some(sched) => sched.yield_now(),
        None => core::hint::spin_loop(),
    }
}

/// Sleeps the current thread for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    let deadline = time::uptime_ms() + ms;
    match SCHED.get() {
        Some(sched) => {
            while time::uptime_ms() < deadline {
                sched.park_current(Some(deadline));
            }
        }
        None => {
            while time::uptime_ms() < deadline {
                core::hint::spin_loop();
            }
        }
    }
}
