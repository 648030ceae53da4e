//! The syscall surface over the core: futex operations, module loading and
//! the memory-mapping family. The architecture's syscall stubs decode the
//! trap frame and call in here; results travel back as `0`-or-negative-
//! errno through [`vesper_abi::errno::encode`].

pub mod mem;
pub mod module;
pub mod thread;

/// POSIX-shaped timeout argument; a null pointer means "forever".
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TimeSpec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl TimeSpec {
    pub fn as_ms(&self) -> u64 {
        (self.tv_sec as u64)
            .saturating_mul(1000)
            .saturating_add(self.tv_nsec as u64 / 1_000_000)
    }
}
