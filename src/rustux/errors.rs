// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Common error types used throughout the socket core

use crate::rustux::types::Status;
use core::fmt;

/// Result type for operations that can fail
pub type Result<T = ()> = core::result::Result<T, Error>;

/// Common error codes
///
/// Only conditions meaningful to a caller are represented here. Usage errors
/// (unlocking a lock that is not held, reference count underflow) are kernel
/// panics, not values of this type.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidArgs = -2,
    BadState = -4,
    NotSupported = -5,
    NoMemory = -6,
    TimedOut = -7,
    NotFound = -8,
    AlreadyExists = -9,
    AccessDenied = -10,
    Io = -11,
    Internal = -12,
    /// Operation would block on a non-blocking object
    ShouldWait = -18,
    WrongType = -19,
    PeerClosed = -20,
    /// Wait was cancelled before its condition became true
    Interrupted = -21,
    ConnectionRefused = -30,
    ConnectionReset = -31,
    NotConnected = -32,
    AlreadyConnected = -33,
    AddrInUse = -34,
    BrokenPipe = -35,
    InProgress = -36,
    MessageTooLong = -37,
}

impl Error {
    /// Convert error to status code
    pub fn to_status(self) -> Status {
        self as Status
    }

    /// Convert status code to error
    pub fn from_status(status: Status) -> Self {
        match status {
            -2 => Error::InvalidArgs,
            -4 => Error::BadState,
            -5 => Error::NotSupported,
            -6 => Error::NoMemory,
            -7 => Error::TimedOut,
            -8 => Error::NotFound,
            -9 => Error::AlreadyExists,
            -10 => Error::AccessDenied,
            -11 => Error::Io,
            -18 => Error::ShouldWait,
            -19 => Error::WrongType,
            -20 => Error::PeerClosed,
            -21 => Error::Interrupted,
            -30 => Error::ConnectionRefused,
            -31 => Error::ConnectionReset,
            -32 => Error::NotConnected,
            -33 => Error::AlreadyConnected,
            -34 => Error::AddrInUse,
            -35 => Error::BrokenPipe,
            -36 => Error::InProgress,
            -37 => Error::MessageTooLong,
            _ => Error::Internal,
        }
    }

    /// Short name, used in log lines
    pub const fn as_str(self) -> &'static str {
        match self {
            Error::InvalidArgs => "invalid arguments",
            Error::BadState => "bad state",
            Error::NotSupported => "not supported",
            Error::NoMemory => "out of memory",
            Error::TimedOut => "timed out",
            Error::NotFound => "not found",
            Error::AlreadyExists => "already exists",
            Error::AccessDenied => "access denied",
            Error::Io => "i/o error",
            Error::Internal => "internal error",
            Error::ShouldWait => "operation would block",
            Error::WrongType => "wrong object type",
            Error::PeerClosed => "peer closed",
            Error::Interrupted => "interrupted",
            Error::ConnectionRefused => "connection refused",
            Error::ConnectionReset => "connection reset",
            Error::NotConnected => "not connected",
            Error::AlreadyConnected => "already connected",
            Error::AddrInUse => "address in use",
            Error::BrokenPipe => "broken pipe",
            Error::InProgress => "operation in progress",
            Error::MessageTooLong => "message too long",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.to_status())
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::from_status(status)
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        err.to_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for err in [
            Error::TimedOut,
            Error::ShouldWait,
            Error::ConnectionReset,
            Error::BrokenPipe,
            Error::AddrInUse,
        ] {
            assert_eq!(Error::from_status(err.to_status()), err);
        }
    }

    #[test]
    fn test_unknown_status_is_internal() {
        assert_eq!(Error::from_status(-999), Error::Internal);
        assert_eq!(Error::from(0), Error::Internal);
    }

    #[test]
    fn test_display() {
        let text = alloc::format!("{}", Error::ConnectionReset);
        assert_eq!(text, "connection reset (-31)");
    }
}
