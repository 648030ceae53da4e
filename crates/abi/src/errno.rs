/// Error numbers returned (negated) from syscalls.
///
/// The values match the classic POSIX assignments so that a libc built for
/// another kernel maps them without a translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted
    Perm = 1,
    /// No such file, directory or module dependency
    NoEnt = 2,
    /// Interrupted call
    Intr = 4,
    /// I/O error
    Io = 5,
    /// Try again; futex word did not hold the expected value
    Again = 11,
    /// Out of memory
    NoMem = 12,
    /// Bad user pointer
    Fault = 14,
    /// Device or resource busy
    Busy = 16,
    /// No such device
    NoDev = 19,
    /// Invalid argument
    Inval = 22,
    /// Image format rejected (bad header, relocation overflow, ...)
    NoExec = 8,
    /// Function not implemented
    NoSys = 38,
    /// Timed out
    TimedOut = 110,
    /// Operation would exceed a fixed capacity
    NoSpc = 28,
    /// Protocol/hardware level transfer error
    Proto = 71,
    /// Endpoint stalled
    Pipe = 32,
}

impl Errno {
    /// The syscall-return encoding: zero is success, errors are negative.
    #[inline]
    pub const fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Perm => "operation not permitted",
            Self::NoEnt => "no such entry",
            Self::Intr => "interrupted",
            Self::Io => "input/output error",
            Self::Again => "resource temporarily unavailable",
            Self::NoMem => "out of memory",
            Self::Fault => "bad address",
            Self::Busy => "device or resource busy",
            Self::NoDev => "no such device",
            Self::Inval => "invalid argument",
            Self::NoExec => "exec format error",
            Self::NoSys => "function not implemented",
            Self::TimedOut => "timed out",
            Self::NoSpc => "no space left",
            Self::Proto => "protocol error",
            Self::Pipe => "broken pipe",
        }
    }
}

/// Syscall result: `Ok(v)` encodes as `v`, `Err(e)` as `-e`.
pub type SysResult<T = usize> = Result<T, Errno>;

#[inline]
pub fn encode(res: SysResult<usize>) -> isize {
    match res {
        Ok(v) => v as isize,
        Err(e) => e.as_isize(),
    }
}
