// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Weft event loops.
//!
//! Each [`EventLoop`] is a single-threaded cooperative scheduler: coroutines
//! spawned onto it run until they yield, callbacks scheduled with
//! [`call_later`] run between coroutine steps, and foreign threads reach the
//! loop through a [`LoopHandle`] which marshals callbacks onto the loop's own
//! thread. The synchronization primitives in `weft-sync` are built entirely
//! on this surface.

pub mod config;
pub mod coroutine;
pub mod eventloop;
pub mod logging;

pub use config::LoopConfig;
pub use coroutine::{current_coroutine, expect_coroutine, spawn, yield_now, CoroutineId};
pub use eventloop::{
    call_later, current_loop, CallbackHandle, EventLoop, LoopClosed, LoopHandle, LoopThread,
};
