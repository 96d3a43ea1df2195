// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the unit tests: every test drives its own event loop.

use futures::Future;
use weft_eventloop::{yield_now, EventLoop};

/// Run `future` as the main coroutine of a fresh event loop.
pub(crate) fn run<F: Future>(future: F) -> F::Output {
    EventLoop::new().expect("event loop").block_on(future)
}

/// Tick the loop until `condition` holds; panics if it never does.
pub(crate) async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        yield_now().await;
    }
    panic!("condition was never reached");
}
