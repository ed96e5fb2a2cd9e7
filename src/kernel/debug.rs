// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Debug Logging
//!
//! Logging macros for the socket core. Records are forwarded to the `log`
//! facade, so the kernel console (or a test harness) decides where they end
//! up by installing a `log::Log` implementation.
//!
//! With the `logging` feature disabled every macro compiles to nothing, but
//! its arguments are still type-checked.
//!
//! # Usage
//!
//! ```text
//! log_debug!("tcp {}: {:?} -> {:?}", id, old, new);
//! log_trace_if!(dropped > 0, "udp: dropped {} datagrams", dropped);
//! ```

/// Log target used for every record emitted by this crate
pub const LOG_TARGET: &str = "rxsock";

#[doc(hidden)]
#[macro_export]
macro_rules! __log_at {
    ($level:ident, $($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        $crate::__log::$level!(target: $crate::kernel::debug::LOG_TARGET, $($arg)*);
        #[cfg(not(feature = "logging"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

/// Log a trace message
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::__log_at!(trace, $($arg)*)
    };
}

/// Log a trace message if condition is true
#[macro_export]
macro_rules! log_trace_if {
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            $crate::log_trace!($($arg)*);
        }
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::__log_at!(debug, $($arg)*)
    };
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::__log_at!(info, $($arg)*)
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::__log_at!(warn, $($arg)*)
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::__log_at!(error, $($arg)*)
    };
}

/// Report a consistency violation and halt the affected subsystem
///
/// Kernel state can no longer be trusted after one of these, so the error is
/// logged and then turned into a panic.
#[inline(never)]
#[track_caller]
pub fn log_fatal(args: core::fmt::Arguments) -> ! {
    crate::log_error!("fatal: {}", args);
    panic!("{}", args);
}
