// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Library Module
//!
//! Data structures shared by the IPC and socket code.

pub mod arena;
pub mod cbuf;

pub use arena::{ObjectPool, PoolSlot};
pub use cbuf::CBuf;
