// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Re-entrant lock keyed on coroutine identity.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use futures::Future;
use tracing::warn;

use weft_eventloop::{current_coroutine, expect_coroutine, CoroutineId};

use super::semaphore::Lock;

struct Inner {
    /// Coroutine currently holding the lock; `None` when unheld.
    holder: Option<CoroutineId>,
    /// Re-entry depth; positive exactly while `holder` is set.
    counter: u32,
    lock: Rc<Lock>,
}

/// Re-entrant mutual exclusion: the holding coroutine may acquire again
/// without deadlocking and must release once per acquire.
pub struct RLock {
    inner: Rc<RefCell<Inner>>,
}

/// Ownership snapshot produced by [`RLock::reset`] and consumed by
/// [`RLock::set`].
#[derive(Debug)]
pub struct RLockState {
    holder: Option<CoroutineId>,
    counter: u32,
}

impl RLock {
    pub fn new() -> Self {
        RLock {
            inner: Rc::new(RefCell::new(Inner {
                holder: None,
                counter: 0,
                lock: Rc::new(Lock::new()),
            })),
        }
    }

    /// Acquire the lock, parking until the current holder lets go.
    ///
    /// Re-entry by the holder succeeds immediately. Resolves to `false` only
    /// if the lock was destroyed while waiting.
    pub fn acquire(&self) -> impl Future<Output = bool> + 'static {
        let inner = self.inner.clone();
        async move {
            let me = expect_coroutine("RLock::acquire");
            let lock = {
                let mut inner = inner.borrow_mut();
                if inner.holder == Some(me) {
                    inner.counter += 1;
                    return true;
                }
                inner.lock.clone()
            };
            if !lock.acquire().await {
                return false;
            }
            let mut inner = inner.borrow_mut();
            inner.holder = Some(me);
            inner.counter = 1;
            true
        }
    }

    /// Non-blocking acquire; `false` when another coroutine holds the lock.
    pub fn try_acquire(&self) -> bool {
        let me = expect_coroutine("RLock::try_acquire");
        let mut inner = self.inner.borrow_mut();
        if inner.holder == Some(me) {
            inner.counter += 1;
            return true;
        }
        if inner.lock.try_acquire() {
            inner.holder = Some(me);
            inner.counter = 1;
            true
        } else {
            false
        }
    }

    /// Undo one acquire. A release by anyone but the holder is logged and
    /// ignored.
    pub fn release(&self) {
        let me = current_coroutine();
        let mut inner = self.inner.borrow_mut();
        if me.is_none() || inner.holder != me {
            warn!("RLock::release by a coroutine that does not hold the lock");
            return;
        }
        inner.counter -= 1;
        if inner.counter == 0 {
            inner.holder = None;
            let lock = inner.lock.clone();
            drop(inner);
            lock.release();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().lock.is_locked()
    }

    /// Whether the current coroutine holds the lock.
    pub fn is_owned(&self) -> bool {
        let inner = self.inner.borrow();
        inner.holder.is_some() && inner.holder == current_coroutine()
    }

    /// Detach the current ownership, releasing the inner lock if it was held.
    ///
    /// Together with [`set`](RLock::set) this lets a coroutine that migrates
    /// across logical contexts carry lock ownership along without
    /// deadlocking itself.
    pub fn reset(&self) -> RLockState {
        let (state, lock) = {
            let mut inner = self.inner.borrow_mut();
            let state = RLockState {
                holder: inner.holder.take(),
                counter: std::mem::take(&mut inner.counter),
            };
            (state, inner.lock.clone())
        };
        if state.counter > 0 {
            lock.release();
        }
        state
    }

    /// Restore ownership saved by [`reset`](RLock::reset).
    ///
    /// When the restored counter is positive the inner lock is re-acquired,
    /// **blocking** until whoever holds it in the meantime releases.
    /// Resolves to `false` only if the lock was destroyed while re-acquiring.
    pub fn set(&self, state: RLockState) -> impl Future<Output = bool> + 'static {
        let inner = self.inner.clone();
        async move {
            let lock = {
                let mut inner = inner.borrow_mut();
                inner.holder = state.holder;
                inner.counter = state.counter;
                inner.lock.clone()
            };
            if state.counter > 0 {
                lock.acquire().await
            } else {
                true
            }
        }
    }
}

impl Default for RLock {
    fn default() -> Self {
        RLock::new()
    }
}

impl Drop for RLock {
    fn drop(&mut self) {
        // Wake coroutines parked on the inner lock with the destroyed result.
        self.inner.borrow().lock.close();
    }
}

impl fmt::Debug for RLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("RLock")
            .field("holder", &inner.holder)
            .field("counter", &inner.counter)
            .finish()
    }
}
