//! Kernel-side futex queues.
//!
//! Queues are keyed by the *physical* address of the user word, so two
//! processes that map one shared page at different virtual addresses park
//! on the same queue. An entry exists only while someone waits on it: the
//! first waiter creates it, the last one out tears it down.
//!
//! Everything runs under one global mutex; the critical sections are a
//! handful of loads and a table probe, and waits release the lock
//! atomically with parking through [`CondVar::wait_deadline`].

use alloc::sync::Arc;

use vesper_abi::{Errno, futex as abi};

use crate::{
    memory::{PhysAddr, VirtAddr, paging, user},
    time,
    utils::{locks::Mutex, phys_map::PhysMap},
};

use super::{WakeReason, condvar::CondVar};

struct FutexEntry {
    waiter_count: usize,
    wake: Arc<CondVar>,
}

static FUTEX_TABLE: Mutex<PhysMap<FutexEntry>> = Mutex::new(PhysMap::new());

fn phys_of(uaddr: *const u32) -> Result<PhysAddr, Errno> {
    if uaddr.is_null() || !uaddr.is_aligned() {
        return Err(Errno::Fault);
    }
    paging::virt_to_phys(VirtAddr::from_ptr(uaddr)).ok_or(Errno::Fault)
}

/// Applies a `wake_op` transform to `value`.
fn apply_op(value: u32, op: u32, oparg: i32) -> u32 {
    let (op, oparg) = if op & abi::FUTEX_OP_ARG_SHIFT != 0 {
        (op - abi::FUTEX_OP_ARG_SHIFT, 1u32.wrapping_shl(oparg as u32) as i32)
    } else {
        (op, oparg)
    };

    match op {
        abi::FUTEX_OP_SET => oparg as u32,
        abi::FUTEX_OP_ADD => value.wrapping_add(oparg as u32),
        abi::FUTEX_OP_OR => value | oparg as u32,
        abi::FUTEX_OP_ANDN => value & !(oparg as u32),
        abi::FUTEX_OP_XOR => value ^ oparg as u32,
        _ => value,
    }
}

fn apply_cmp(value: u32, cmp: u32, cmparg: u32) -> bool {
    let (value, cmparg) = (value as i32, cmparg as i32);
    match cmp {
        abi::FUTEX_CMP_EQ => value == cmparg,
        abi::FUTEX_CMP_NE => value != cmparg,
        abi::FUTEX_CMP_LT => value < cmparg,
        abi::FUTEX_CMP_LE => value <= cmparg,
        abi::FUTEX_CMP_GT => value > cmparg,
        abi::FUTEX_CMP_GE => value >= cmparg,
        _ => false,
    }
}

type Table<'a> = crate::utils::locks::MutexGuard<'a, PhysMap<FutexEntry>>;

/// Registers the current thread as a waiter, parks, unregisters. Gives the
/// table lock back to the caller along with the wake status.
fn park_on_entry<'a>(
    mut table: Table<'a>,
    phys: PhysAddr,
    deadline_ms: Option<u64>,
) -> Result<(Table<'a>, WakeReason), Errno> {
    let wake = if let Some(entry) = table.lookup_mut(phys) {
        entry.waiter_count += 1;
        entry.wake.clone()
    } else {
        let wake = Arc::new(CondVar::new());
        table
            .insert(
                phys,
                FutexEntry {
                    waiter_count: 1,
                    wake: wake.clone(),
                },
            )
            .map_err(|()| Errno::NoMem)?;
        wake
    };

    let (mut table, reason) = wake.wait_deadline(table, deadline_ms);

    let entry = table
        .lookup_mut(phys)
        .expect("futex entry vanished while it had a waiter");
    entry.waiter_count -= 1;
    if entry.waiter_count == 0 {
        table.remove(phys);
    }

    Ok((table, reason))
}

/// FUTEX_WAIT: parks while `*uaddr == expect`.
///
/// The user word is read under the table lock, so a waker that changes the
/// word and then calls [`wake`] cannot slip between our check and our park.
/// `timeout_ms` of `None` waits forever; expiry returns `Errno::TimedOut`,
/// a value mismatch `Errno::Again`.
pub fn wait(uaddr: *mut u32, expect: u32, timeout_ms: Option<u64>) -> Result<(), Errno> {
    let table = FUTEX_TABLE.lock();

    let phys = phys_of(uaddr)?;
    let value = user::user_load_u32(uaddr)?;
    if value != expect {
        return Err(Errno::Again);
    }

    let deadline = timeout_ms.map(|ms| time::uptime_ms() + ms);
    let (_table, reason) = park_on_entry(table, phys, deadline)?;

    match reason {
        WakeReason::Woken => Ok(()),
        WakeReason::TimedOut => Err(Errno::TimedOut),
    }
}

/// FUTEX_WAKE: wakes up to `n` waiters; a missing entry wakes zero and is
/// not an error.
pub fn wake(uaddr: *mut u32, n: usize) -> Result<usize, Errno> {
    let table = FUTEX_TABLE.lock();
    let phys = phys_of(uaddr)?;

    let woken = match table.lookup(phys) {
        Some(entry) => entry.wake.notify_n(n),
        None => 0,
    };
    Ok(woken)
}

/// FUTEX_WAKE_OP: atomically `*uaddr2 = *uaddr2 <op> oparg`, wake up to
/// `n1` on `uaddr`, and when `<old uaddr2> <cmp> cmparg` holds wake up to
/// `n2` on `uaddr2`. Returns `n1 + n2`.
pub fn wake_op(
    uaddr2: *mut u32,
    op_param: abi::OpParam,
    uaddr: *mut u32,
    n1: usize,
    n2: usize,
) -> Result<usize, Errno> {
    let table = FUTEX_TABLE.lock();

    let phys = phys_of(uaddr)?;
    let phys2 = phys_of(uaddr2)?;

    let op = op_param.op();
    let cmp = op_param.cmp();
    let oparg = op_param.oparg();
    let cmparg = op_param.cmparg();

    // Retry against racing user-space stores; a plain load-modify-store
    // would lose their update.
    let mut old2 = user::user_load_u32(uaddr2)?;
    loop {
        let replacement = apply_op(old2, op, oparg);
        if user::user_cas_u32(uaddr2, &mut old2, replacement)? {
            break;
        }
        core::hint::spin_loop();
    }

    if let Some(entry) = table.lookup(phys) {
        entry.wake.notify_n(n1);
    }

    if apply_cmp(old2, cmp, cmparg) {
        if let Some(entry) = table.lookup(phys2) {
            entry.wake.notify_n(n2);
        }
    }

    Ok(n1 + n2)
}

/// FUTEX_WAIT_OP: atomically transform `*lock_word` (releasing a user
/// mutex), wake up to `n` of its waiters, then park on `cond_word`, all
/// without dropping the futex lock in between. This is the kernel half of
/// a userspace condition-variable wait.
pub fn wait_op(
    lock_word: *mut u32,
    op_param: abi::OpParam,
    cond_word: *mut u32,
    n: usize,
    timeout_ms: Option<u64>,
) -> Result<usize, Errno> {
    let table = FUTEX_TABLE.lock();

    let lock_phys = phys_of(lock_word)?;
    let cond_phys = phys_of(cond_word)?;

    let op = op_param.op();
    let oparg = op_param.oparg();

    let mut old = user::user_load_u32(lock_word)?;
    loop {
        let replacement = apply_op(old, op, oparg);
        if user::user_cas_u32(lock_word, &mut old, replacement)? {
            break;
        }
        core::hint::spin_loop();
    }

    if let Some(entry) = table.lookup(lock_phys) {
        entry.wake.notify_n(n);
    }

    let deadline = timeout_ms.map(|ms| time::uptime_ms() + ms);
    let (_table, reason) = park_on_entry(table, cond_phys, deadline)?;

    match reason {
        WakeReason::Woken => Ok(n),
        WakeReason::TimedOut => Err(Errno::TimedOut),
    }
}

/// Number of live futex entries; diagnostic only.
pub fn entry_count() -> usize {
    FUTEX_TABLE.lock().len()
}

/// Number of threads parked on `uaddr`'s queue; diagnostic only.
pub fn waiter_count(uaddr: *mut u32) -> usize {
    let table = FUTEX_TABLE.lock();
    let Ok(phys) = phys_of(uaddr) else { return 0 };
    table.lookup(phys).map_or(0, |entry| entry.waiter_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    fn spawn_waiter(
        word: &'static AtomicU32,
        expect: u32,
        woken: &'static AtomicUsize,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            test_support::register_thread();
            let res = wait(word.as_ptr(), expect, None);
            assert_eq!(res, Ok(()));
            woken.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never became true");
    }

    #[test]
    fn wait_rejects_wrong_value() {
        test_support::init();
        static WORD: AtomicU32 = AtomicU32::new(7);
        assert_eq!(wait(WORD.as_ptr(), 8, None), Err(Errno::Again));
    }

    #[test]
    fn wait_times_out_and_drops_entry() {
        test_support::init();
        static WORD: AtomicU32 = AtomicU32::new(0);
        assert_eq!(wait(WORD.as_ptr(), 0, Some(30)), Err(Errno::TimedOut));
        // The timed-out waiter was the only one; its entry is gone.
        assert_eq!(waiter_count(WORD.as_ptr()), 0);
    }

    #[test]
    fn wake_releases_all_waiters() {
        test_support::init();
        static WORD: AtomicU32 = AtomicU32::new(0);
        static WOKEN: AtomicUsize = AtomicUsize::new(0);

        let handles: alloc::vec::Vec<_> =
            (0..3).map(|_| spawn_waiter(&WORD, 0, &WOKEN)).collect();

        // All three must be parked before we wake.
        wait_for(|| waiter_count(WORD.as_ptr()) == 3);
        assert_eq!(WOKEN.load(Ordering::SeqCst), 0);

        WORD.store(1, Ordering::SeqCst);
        let woken = wake(WORD.as_ptr(), usize::MAX).unwrap();
        assert_eq!(woken, 3);

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(WOKEN.load(Ordering::SeqCst), 3);
        // Last waiter out destroyed the entry.
        wait_for(|| waiter_count(WORD.as_ptr()) == 0);
    }

    #[test]
    fn waiters_wake_in_arrival_order() {
        test_support::init();
        static WORD: AtomicU32 = AtomicU32::new(0);
        static ORDER: StdMutex<alloc::vec::Vec<u32>> = StdMutex::new(alloc::vec::Vec::new());

        let spawn_ordered = |tag: u32| {
            thread::spawn(move || {
                test_support::register_thread();
                wait(WORD.as_ptr(), 0, None).unwrap();
                ORDER.lock().unwrap().push(tag);
            })
        };

        // First waiter parks before the second arrives, so the queue order
        // is known.
        let first = spawn_ordered(1);
        wait_for(|| waiter_count(WORD.as_ptr()) == 1);
        thread::sleep(Duration::from_millis(20));
        let second = spawn_ordered(2);
        wait_for(|| waiter_count(WORD.as_ptr()) == 2);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(wake(WORD.as_ptr(), 1).unwrap(), 1);
        first.join().unwrap();
        assert_eq!(ORDER.lock().unwrap().as_slice(), &[1]);

        assert_eq!(wake(WORD.as_ptr(), 1).unwrap(), 1);
        second.join().unwrap();
        assert_eq!(ORDER.lock().unwrap().as_slice(), &[1, 2]);
    }

    #[test]
    fn wake_op_applies_transform_and_wakes_both_sides() {
        test_support::init();
        static UADDR: AtomicU32 = AtomicU32::new(0);
        static UADDR2: AtomicU32 = AtomicU32::new(5);
        static WOKEN: AtomicUsize = AtomicUsize::new(0);

        let waiter = spawn_waiter(&UADDR, 0, &WOKEN);
        wait_for(|| waiter_count(UADDR.as_ptr()) == 1);
        thread::sleep(Duration::from_millis(20));

        // *uaddr2 += 1 << 0; wake 1 on uaddr; wake 1 on uaddr2 if old == 6.
        // old is 5, so the second wake does not fire, but the transform and
        // first wake do, and the return value is the requested total.
        let param = abi::OpParam::new(
            abi::FUTEX_OP_ADD | abi::FUTEX_OP_ARG_SHIFT,
            0,
            abi::FUTEX_CMP_EQ,
            6,
        );
        let ret = wake_op(UADDR2.as_ptr(), param, UADDR.as_ptr(), 1, 1).unwrap();

        assert_eq!(ret, 2);
        assert_eq!(UADDR2.load(Ordering::SeqCst), 6);
        waiter.join().unwrap();
        assert_eq!(WOKEN.load(Ordering::SeqCst), 1);

        // Running it again compares 6 == 6; with nobody parked anywhere the
        // wakes fall through but the transform still applies.
        let ret = wake_op(UADDR2.as_ptr(), param, UADDR.as_ptr(), 1, 1).unwrap();
        assert_eq!(ret, 2);
        assert_eq!(UADDR2.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn wait_op_releases_lock_then_parks() {
        test_support::init();
        static LOCK: AtomicU32 = AtomicU32::new(1);
        static COND: AtomicU32 = AtomicU32::new(0);
        static DONE: AtomicUsize = AtomicUsize::new(0);

        let parked = thread::spawn(|| {
            test_support::register_thread();
            // Set *lock to 0 (release), then park on cond.
            let param = abi::OpParam::new(abi::FUTEX_OP_SET, 0, abi::FUTEX_CMP_EQ, 0);
            let ret = wait_op(LOCK.as_ptr(), param, COND.as_ptr(), 1, None);
            assert_eq!(ret, Ok(1));
            DONE.fetch_add(1, Ordering::SeqCst);
        });

        // The transform must be visible before the thread is woken.
        wait_for(|| LOCK.load(Ordering::SeqCst) == 0);
        wait_for(|| waiter_count(COND.as_ptr()) == 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(DONE.load(Ordering::SeqCst), 0);

        wake(COND.as_ptr(), 1).unwrap();
        parked.join().unwrap();
        assert_eq!(DONE.load(Ordering::SeqCst), 1);
    }
}
