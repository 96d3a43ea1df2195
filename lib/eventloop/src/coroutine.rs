// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coroutine identity.
//!
//! A coroutine is a task spawned onto an event loop through [`spawn`]. While
//! it polls, a thread-local cell exposes its [`CoroutineId`]; everywhere else
//! on the loop thread (the loop driver, deferred callbacks) the cell is empty,
//! which is how blocking primitives detect the fatal "called from the event
//! loop itself" misuse.

use std::cell::Cell;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Future;

/// Stable identifier of a coroutine, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineId(u64);

impl CoroutineId {
    fn next() -> Self {
        CoroutineId(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<CoroutineId>> = const { Cell::new(None) };
}

/// Identifier of the coroutine currently polling on this thread, or `None`
/// when running as the event loop itself (driver or deferred callback).
pub fn current_coroutine() -> Option<CoroutineId> {
    CURRENT.get()
}

/// Like [`current_coroutine`], but a missing coroutine context is a fatal
/// misuse: `operation` would have to suspend the event loop itself, which can
/// never make progress.
pub fn expect_coroutine(operation: &str) -> CoroutineId {
    match current_coroutine() {
        Some(id) => id,
        None => panic!(
            "{operation} would block, but it was invoked from the event loop \
             itself; blocking operations may only run inside a spawned coroutine"
        ),
    }
}

/// Spawn a coroutine onto the current event loop.
///
/// Panics when called outside a running event loop, like the underlying
/// `spawn_local`.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    tokio::task::spawn_local(wrap(future))
}

/// Wrap a future so it polls with a fresh coroutine identity installed.
pub(crate) fn wrap<F: Future>(inner: F) -> Coroutine<F> {
    Coroutine {
        id: CoroutineId::next(),
        inner,
    }
}

pub(crate) struct Coroutine<F> {
    id: CoroutineId,
    inner: F,
}

impl<F: Future> Future for Coroutine<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        // Safety: `inner` is never moved out of the pinned wrapper.
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };
        let _enter = Enter::new(this.id);
        inner.poll(cx)
    }
}

/// Restores the previous identity even if the inner poll panics.
struct Enter {
    previous: Option<CoroutineId>,
}

impl Enter {
    fn new(id: CoroutineId) -> Self {
        Enter {
            previous: CURRENT.replace(Some(id)),
        }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        CURRENT.set(self.previous);
    }
}

/// Yield to the event loop once and resume on the next scheduler pass.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coroutine_ids_are_unique() {
        let a = CoroutineId::next();
        let b = CoroutineId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn plain_threads_have_no_coroutine() {
        assert_eq!(current_coroutine(), None);
    }

    #[test]
    #[should_panic(expected = "would block")]
    fn expect_coroutine_outside_a_coroutine_is_fatal() {
        expect_coroutine("Semaphore::acquire");
    }
}
