// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Common type aliases used throughout the socket core

/// Size type
pub type Size = usize;

/// Error code type (negative values indicate errors)
pub type Status = i32;

/// CPU ID type
pub type CpuId = u32;

/// Network interface index
pub type IfIndex = u32;

/// Time value in nanoseconds
pub type Nanoseconds = u64;

/// Time value in milliseconds
pub type Milliseconds = u64;

/// Deadline meaning "wait forever"
pub const INFINITE_TIME: Nanoseconds = u64::MAX;

/// Nanoseconds per millisecond
pub const NS_PER_MS: Nanoseconds = 1_000_000;

/// Convert milliseconds to nanoseconds, saturating
#[inline]
pub const fn ms_to_ns(ms: Milliseconds) -> Nanoseconds {
    ms.saturating_mul(NS_PER_MS)
}

/// Compute a deadline `timeout` after `now`, saturating at [`INFINITE_TIME`]
#[inline]
pub const fn deadline_after(now: Nanoseconds, timeout: Nanoseconds) -> Nanoseconds {
    now.saturating_add(timeout)
}
