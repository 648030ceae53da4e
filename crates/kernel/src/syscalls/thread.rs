//! The futex syscall.

use vesper_abi::{
    Errno,
    errno::SysResult,
    futex::{
        FUTEX_PRIVATE_FLAG, FUTEX_WAIT, FUTEX_WAIT_OP, FUTEX_WAKE, FUTEX_WAKE_OP, OpParam,
    },
};

use crate::{memory::user, thread::futex};

use super::TimeSpec;

fn timeout_ms(timeout: *const TimeSpec) -> Result<Option<u64>, Errno> {
    if timeout.is_null() {
        return Ok(None);
    }
    let spec = user::copy_from_user(timeout)?;
    Ok(Some(spec.as_ms()))
}

/// `futex(uaddr, op, val, timeout, uaddr2, val3)`.
///
/// `PRIVATE_FLAG` is accepted and ignored: the queues are keyed by
/// physical address, so every futex is implicitly cross-process capable.
/// For `WAKE_OP` the timeout argument slot carries the second wake count,
/// as in the classic calling convention.
pub fn sys_futex(
    uaddr: *mut u32,
    futex_op: u32,
    val: u32,
    timeout: *const TimeSpec,
    uaddr2: *mut u32,
    val3: u32,
) -> SysResult<usize> {
    match futex_op & !FUTEX_PRIVATE_FLAG {
        FUTEX_WAIT => {
            futex::wait(uaddr, val, timeout_ms(timeout)?)?;
            Ok(0)
        }
        FUTEX_WAKE => futex::wake(uaddr, val as usize),
        FUTEX_WAKE_OP => {
            let val2 = timeout as usize;
            futex::wake_op(uaddr2, OpParam(val3), uaddr, val as usize, val2)
        }
        FUTEX_WAIT_OP => futex::wait_op(
            uaddr2,
            OpParam(val3),
            uaddr,
            val as usize,
            timeout_ms(timeout)?,
        ),
        _ => Err(Errno::Inval),
    }
}
