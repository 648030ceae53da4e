//! Host-side implementations of the platform hooks, so the unit tests run
//! the real code paths under the standard harness. Physical and virtual
//! addresses coincide (direct-map offset zero), frames come from a leaked
//! heap arena, and parking is backed by std condition variables.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar as StdCondvar, Mutex as StdMutex, Once, OnceLock};
use std::time::{Duration, Instant};

use crate::memory::frame_allocator;
use crate::memory::paging::{self, EntryFlags, MapToError, PAGE_SIZE, PagingOps};
use crate::memory::{PhysAddr, VirtAddr};
use crate::thread::{self, SchedOps, Tid, WakeReason};
use crate::time::TimeOps;

const ARENA_BYTES: usize = 64 << 20;

struct HostTime(Instant);

impl TimeOps for HostTime {
    fn uptime_ms(&self) -> u64 {
        self.0.elapsed().as_millis() as u64
    }
}

struct HostPaging;

impl PagingOps for HostPaging {
    fn reserve_span(&self, pages: usize) -> Option<VirtAddr> {
        let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).ok()?;
        // Spans are committed zeroed memory on the host; map_page below is
        // bookkeeping only. Leaked deliberately: tests tear nothing down.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() { None } else { Some(VirtAddr::from_ptr(ptr)) }
    }

    fn release_span(&self, _base: VirtAddr, _pages: usize) {}

    fn map_page(
        &self,
        _page: VirtAddr,
        _frame: frame_allocator::Frame,
        _flags: EntryFlags,
    ) -> Result<(), MapToError> {
        Ok(())
    }

    fn unmap_page(&self, _page: VirtAddr) {}

    fn protect(&self, _base: VirtAddr, _pages: usize, _flags: EntryFlags) {}

    fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::from(addr.into_raw()))
    }
}

type Parker = Arc<(StdMutex<bool>, StdCondvar)>;

struct HostSched {
    parkers: StdMutex<HashMap<Tid, Parker>>,
    next_tid: AtomicU32,
}

thread_local! {
    static CURRENT_TID: std::cell::Cell<Option<Tid>> = const { std::cell::Cell::new(None) };
}

impl HostSched {
    fn parker(&self, tid: Tid) -> Parker {
        self.parkers
            .lock()
            .unwrap()
            .entry(tid)
            .or_insert_with(|| Arc::new((StdMutex::new(false), StdCondvar::new())))
            .clone()
    }
}

impl SchedOps for HostSched {
    fn current(&self) -> Tid {
        CURRENT_TID.with(|cell| match cell.get() {
            Some(tid) => tid,
            None => {
                let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
                cell.set(Some(tid));
                self.parker(tid);
                tid
            }
        })
    }

    fn park_current(&self, deadline_ms: Option<u64>) -> WakeReason {
        let parker = self.parker(self.current());
        let (lock, cvar) = &*parker;
        let mut token = lock.lock().unwrap();
        loop {
            if *token {
                *token = false;
                return WakeReason::Woken;
            }
            match deadline_ms {
                None => token = cvar.wait(token).unwrap(),
                Some(deadline) => {
                    let now = crate::time::uptime_ms();
                    if now >= deadline {
                        return WakeReason::TimedOut;
                    }
                    let wait = Duration::from_millis(deadline - now);
                    token = cvar.wait_timeout(token, wait).unwrap().0;
                }
            }
        }
    }

    fn resume(&self, tid: Tid) {
        let parker = self.parker(tid);
        let (lock, cvar) = &*parker;
        *lock.lock().unwrap() = true;
        cvar.notify_one();
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn cpu_count(&self) -> usize {
        1
    }

    fn current_cpu(&self) -> usize {
        0
    }
}

static INIT: Once = Once::new();
static SCHED: OnceLock<HostSched> = OnceLock::new();
static TIME: OnceLock<HostTime> = OnceLock::new();

/// Installs every hook once per test process and feeds the frame
/// allocator. Safe to call from every test.
pub fn init() {
    INIT.call_once(|| {
        TIME.set(HostTime(Instant::now())).ok().unwrap();
        crate::time::init(TIME.get().unwrap());

        crate::logging::set_sink(|args| eprint!("{args}"));

        paging::init(&HostPaging);

        SCHED
            .set(HostSched {
                parkers: StdMutex::new(HashMap::new()),
                next_tid: AtomicU32::new(1),
            })
            .ok()
            .unwrap();
        thread::init_sched(SCHED.get().unwrap());
        thread::work_queue::init(1);

        let layout = std::alloc::Layout::from_size_align(ARENA_BYTES, PAGE_SIZE).unwrap();
        let arena = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!arena.is_null());
        unsafe {
            frame_allocator::add_region(
                PhysAddr::from(arena.addr()),
                ARENA_BYTES,
            );
        }
    });

    register_thread();
}

/// Gives the calling thread a TID and a parker. Spawned test threads call
/// this before touching any blocking primitive.
pub fn register_thread() -> Tid {
    thread::current_tid()
}
