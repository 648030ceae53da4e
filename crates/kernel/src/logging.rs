//! Leveled log macros over a platform-installed sink.
//!
//! The kernel proper points the sink at the serial console; unit tests
//! install a host writer. Nothing is buffered here: a line is formatted and
//! handed to the sink in one call, so the macros are safe from any context
//! the sink is.

use core::fmt;

use spin::Once;

static SINK: Once<fn(fmt::Arguments)> = Once::new();

/// Install the output sink. Later calls are ignored.
pub fn set_sink(sink: fn(fmt::Arguments)) {
    SINK.call_once(|| sink);
}

#[doc(hidden)]
pub fn _log(args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        sink(args);
    }
}

pub(crate) fn log_time_parts(ms: u64) -> (u32, u8, u8, u16) {
    let seconds = ms / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    (
        hours as u32,
        (minutes % 60) as u8,
        (seconds % 60) as u8,
        (ms % 1000) as u16,
    )
}

pub const MIN_LOG_TYPE_NAME_WIDTH: usize = 5;

#[macro_export]
macro_rules! logln {
    ($($arg:tt)*) => {{
        let (hours, minutes, seconds, ms) =
            $crate::logging::log_time_parts($crate::time!(ms));
        $crate::logging::_log(format_args!(
            "[{hours:02}:{minutes:02}:{seconds:02}.{ms:03}] {}\n",
            format_args!($($arg)*)
        ));
    }};
}

#[macro_export]
macro_rules! logln_ext {
    ($name: literal, $name_color: literal, as $kind: expr, $($arg:tt)*) => {
        $crate::logln!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m {kind}:\x1B[0m {}",
            format_args!($($arg)*), name_color = $name_color, name = $name, kind = $kind,
            width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };

    ($name: literal, $name_color: literal, $($arg:tt)*) => {
        $crate::logln!("[  \x1B[{name_color}m{name:<width$}\x1B[0m  ]\x1b[90m:\x1B[0m {}",
            format_args!($($arg)*), name_color = $name_color, name = $name,
            width = $crate::logging::MIN_LOG_TYPE_NAME_WIDTH)
    };
}

/// Runtime debug info, tagged with the type it concerns.
#[macro_export]
macro_rules! debug {
    ($mod: ty, $($arg:tt)*) => {{
        // makes sure $mod is a valid type
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("debug", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => {{
        $crate::logln_ext!("debug", 91, $($arg)*)
    }};
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::logln_ext!("info", 92, $($arg)*));
}

#[macro_export]
macro_rules! warn {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("warn", 93, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("warn", 93, $($arg)*));
}

#[macro_export]
macro_rules! error {
    ($mod: ty, $($arg:tt)*) => {{
        let _ = core::marker::PhantomData::<$mod>;
        $crate::logln_ext!("error", 91, as stringify!($mod), $($arg)*)
    }};
    ($($arg:tt)*) => ($crate::logln_ext!("error", 91, $($arg)*));
}
