//! Monotonic uptime, fed by the platform timer.

use spin::Once;

/// Monotonic time source. The platform installs one backed by its timer;
/// the host tests install one backed by `std::time::Instant`.
pub trait TimeOps: Sync {
    /// Milliseconds since the source was started.
    fn uptime_ms(&self) -> u64;
}

static TIME: Once<&'static dyn TimeOps> = Once::new();

pub fn init(ops: &'static dyn TimeOps) {
    TIME.call_once(|| ops);
}

/// Returns 0 until a source is installed so early logging stays usable.
pub fn uptime_ms() -> u64 {
    TIME.get().map_or(0, |t| t.uptime_ms())
}

/// Returns the number of milliseconds since the platform timer started.
#[macro_export]
macro_rules! time {
    (ms) => {
        $crate::time::uptime_ms()
    };
    () => {
        $crate::time::uptime_ms()
    };
}

/// Sleeps the current thread for the given duration.
#[macro_export]
macro_rules! sleep {
    ($ms:expr, ms) => {
        $crate::thread::sleep_ms($ms)
    };
    ($ms:literal ms) => {
        $crate::thread::sleep_ms($ms)
    };
}

/// Spins (yielding) until `$cond` holds or `$timeout` milliseconds pass.
/// Evaluates to whether the condition was met in time.
#[macro_export]
macro_rules! sleep_until {
    ($timeout:literal ms, $cond:expr) => {{
        let deadline = $crate::time::uptime_ms() + $timeout;
        let mut met = true;
        while !$cond {
            if $crate::time::uptime_ms() >= deadline {
                met = false;
                break;
            }
            $crate::thread::yield_now();
        }
        met
    }};
}
