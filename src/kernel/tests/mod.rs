// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cross-Module Tests
//!
//! Scenarios that span several subsystems and run on real threads through
//! the hosted scheduler. Unit tests live beside the code they test.
//!
//! # Organization
//!
//! - [`loopback`] - A network layer that hands every packet back to the stack
//! - [`sync_tests`] - Lock stress under contention
//! - [`stream_tests`] - Randomized transfers through pipes and stream sockets
//! - [`socket_tests`] - TCP over loopback, datagrams, timeouts, poll

mod stream_tests;
mod sync_tests;
