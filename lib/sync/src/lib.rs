// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cooperative synchronization primitives for weft coroutines.
//!
//! Everything except [`ThreadEvent`] is affined to a single event loop:
//! "blocking" means parking the calling coroutine and yielding to the loop,
//! and releases resume waiters through a deferred zero-delay callback, never
//! inline. [`ThreadEvent`] is the one primitive that may be shared freely
//! across OS threads and event loops.
//!
//! Blocking operations return futures; their non-blocking counterparts are
//! the `try_*` / `is_*` methods. A `false` result from a blocking operation
//! means the primitive was destroyed while the caller waited; cancellation
//! (dropping the future at its suspension point) always leaves the primitive
//! as if the caller had never enqueued.

pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use sync::condition::Condition;
pub use sync::event::{Event, ValueEvent};
pub use sync::gate::Gate;
pub use sync::rlock::{RLock, RLockState};
pub use sync::semaphore::{
    acquire_any, try_acquire_any, Acquire, AcquireAny, Lock, Semaphore, SemaphoreGuard,
};
pub use sync::thread_event::ThreadEvent;

pub use weft_eventloop::{
    current_coroutine, spawn, yield_now, CoroutineId, EventLoop, LoopHandle,
};
