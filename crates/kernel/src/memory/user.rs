//! Guarded access to user memory.
//!
//! The architecture layer gives the kernel nofault copy routines; at this
//! level we validate the pointers we are handed and keep every user access
//! in one place so the syscall layer never dereferences raw user pointers
//! itself. A fault surfaces as [`Errno::Fault`], never a retry.

use core::sync::atomic::{AtomicU32, Ordering};

use vesper_abi::Errno;

use alloc::string::String;
use alloc::vec::Vec;

fn check<T>(ptr: *const T) -> Result<(), Errno> {
    if ptr.is_null() || !ptr.is_aligned() {
        return Err(Errno::Fault);
    }
    Ok(())
}

pub fn copy_from_user<T: Copy>(src: *const T) -> Result<T, Errno> {
    check(src)?;
    Ok(unsafe { core::ptr::read_volatile(src) })
}

pub fn copy_to_user<T: Copy>(dst: *mut T, value: T) -> Result<(), Errno> {
    check(dst)?;
    unsafe { core::ptr::write_volatile(dst, value) };
    Ok(())
}

pub fn copy_bytes_from_user(src: *const u8, len: usize) -> Result<Vec<u8>, Errno> {
    check(src)?;
    let mut out = Vec::new();
    out.try_reserve_exact(len).map_err(|_| Errno::NoMem)?;
    unsafe {
        core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
        out.set_len(len);
    }
    Ok(out)
}

pub fn copy_bytes_to_user(dst: *mut u8, bytes: &[u8]) -> Result<(), Errno> {
    check(dst)?;
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    }
    Ok(())
}

/// Copies a NUL-terminated user string, rejecting anything longer than
/// `max` bytes (terminator included).
pub fn copy_str_from_user(src: *const u8, max: usize) -> Result<String, Errno> {
    check(src)?;
    let mut bytes = Vec::new();
    for i in 0..max {
        let b = unsafe { core::ptr::read_volatile(src.add(i)) };
        if b == 0 {
            return String::from_utf8(bytes).map_err(|_| Errno::Inval);
        }
        bytes.push(b);
    }
    Err(Errno::Inval)
}

/// Nofault compare-exchange on a user word. `expected` is updated with the
/// observed value on failure, mirroring the hardware CAS contract, so
/// callers can loop against racing user-space writers.
pub fn user_cas_u32(uaddr: *mut u32, expected: &mut u32, new: u32) -> Result<bool, Errno> {
    check(uaddr as *const u32)?;
    let atom = unsafe { AtomicU32::from_ptr(uaddr) };
    match atom.compare_exchange(*expected, new, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => Ok(true),
        Err(seen) => {
            *expected = seen;
            Ok(false)
        }
    }
}

/// Plain load of a user word with fault checking.
pub fn user_load_u32(uaddr: *const u32) -> Result<u32, Errno> {
    check(uaddr)?;
    let atom = unsafe { AtomicU32::from_ptr(uaddr as *mut u32) };
    Ok(atom.load(Ordering::SeqCst))
}
