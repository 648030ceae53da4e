//! A condition variable for kernel threads.
//!
//! The caller holds a [`Mutex`] guard; `wait` registers the thread on the
//! condition's internal queue *before* releasing that mutex, which closes
//! the lost-wakeup window: a waker that observes the protected state after
//! our release necessarily finds us on the queue. The park itself carries a
//! wake token, so a wake landing between release and park is kept.

use crate::utils::locks::MutexGuard;

use super::{WakeReason, sched, wait_queue::WaitQueue};

#[derive(Debug, Default)]
pub struct CondVar {
    queue: WaitQueue,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    /// Releases `guard`, parks until notified, reacquires the mutex.
    /// May wake spuriously; callers loop on their predicate.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.wait_deadline(guard, None).0
    }

    /// Like [`Self::wait`] with a wake-by deadline in uptime milliseconds.
    pub fn wait_deadline<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline_ms: Option<u64>,
    ) -> (MutexGuard<'a, T>, WakeReason) {
        let tid = self.queue.enqueue_current();
        let mutex = lock_api::MutexGuard::mutex(&guard);
        drop(guard);

        let mut reason = sched().park_current(deadline_ms);
        if reason == WakeReason::TimedOut && !self.queue.remove(tid) {
            // A waker dequeued us concurrently with the timeout; count the
            // wake. Its token is consumed by the next park at worst, which
            // every caller tolerates as a spurious wakeup.
            reason = WakeReason::Woken;
        }

        (mutex.lock(), reason)
    }

    /// Wakes up to `n` waiters in FIFO order; returns how many.
    pub fn notify_n(&self, n: usize) -> usize {
        self.queue.wake_n(n)
    }

    pub fn notify_one(&self) -> usize {
        self.queue.wake_one()
    }

    pub fn notify_all(&self) -> usize {
        self.queue.wake_all()
    }

    pub fn has_waiters(&self) -> bool {
        !self.queue.is_empty()
    }
}
