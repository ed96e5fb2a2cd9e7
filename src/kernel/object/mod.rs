// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Objects
//!
//! Byte-stream objects that are not sockets.
//!
//! # Modules
//!
//! - [`pipe`] - Anonymous pipes and FIFOs

pub mod pipe;

// Re-exports
pub use pipe::{OpenFlags, Pipe, PipeEnd, PipeId, PipeMode, Pipes};
