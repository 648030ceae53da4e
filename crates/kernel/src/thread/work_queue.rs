//! Per-CPU work queues.
//!
//! Interrupt top halves enqueue here and return; a kernel worker thread
//! per CPU drains its queue in thread context, where it may take sleeping
//! locks and allocate. The xHCI bottom half runs through this path.

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use spin::Once;

use crate::utils::locks::SpinLock;

use super::{sched, wait_queue::WaitQueue};

pub type Work = Box<dyn FnOnce() + Send>;

struct CpuQueue {
    items: SpinLock<VecDeque<Work>>,
    idle: WaitQueue,
}

impl CpuQueue {
    const fn new() -> Self {
        Self {
            items: SpinLock::new(VecDeque::new()),
            idle: WaitQueue::new(),
        }
    }
}

static QUEUES: Once<Vec<CpuQueue>> = Once::new();

/// Sets up one queue per CPU. Workers are started by the platform calling
/// [`worker_main`] on a kernel thread per CPU afterwards.
pub fn init(cpu_count: usize) {
    QUEUES.call_once(|| {
        let mut queues = Vec::with_capacity(cpu_count);
        queues.resize_with(cpu_count, CpuQueue::new);
        queues
    });
}

fn queues() -> &'static [CpuQueue] {
    QUEUES.get().expect("work queues used before init")
}

/// Queues `work` for the given CPU's worker. Callable from interrupt
/// context: the only lock taken is the queue's spinlock, which no consumer
/// holds while running work.
pub fn enqueue_on(cpu: usize, work: Work) {
    let queue = &queues()[cpu % queues().len()];
    queue.items.lock().push_back(work);
    queue.idle.wake_one();
}

/// Runs queued work for `cpu` until the queue is momentarily empty.
/// Returns the number of items executed.
pub fn drain(cpu: usize) -> usize {
    let queue = &queues()[cpu % queues().len()];
    let mut executed = 0;
    loop {
        let work = queue.items.lock().pop_front();
        match work {
            Some(work) => {
                work();
                executed += 1;
            }
            None => return executed,
        }
    }
}

/// The worker loop; the platform parks one kernel thread per CPU here.
pub fn worker_main(cpu: usize) -> ! {
    let queue = &queues()[cpu % queues().len()];
    loop {
        drain(cpu);

        // Queue membership before the emptiness re-check, so an enqueue
        // racing with us either sees us parked or we see its item.
        let tid = queue.idle.enqueue_current();
        if !queue.items.lock().is_empty() {
            queue.idle.remove(tid);
            continue;
        }
        sched().park_current(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drain_runs_in_fifo_order() {
        test_support::init();

        static ORDER: AtomicUsize = AtomicUsize::new(0);
        for expect in 0..8usize {
            enqueue_on(0, Box::new(move || {
                let seen = ORDER.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, expect);
            }));
        }

        assert_eq!(drain(0), 8);
        assert_eq!(ORDER.load(Ordering::SeqCst), 8);
        assert_eq!(drain(0), 0);
    }
}
