// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Binary open/closed barrier.
//!
//! Passing through an open gate is free and non-consuming; passing through a
//! closed one parks the coroutine until the gate reopens. The gate is a thin
//! wrapper over one shared [`Lock`]: open means unlocked.

use std::fmt;
use std::rc::Rc;

use futures::Future;

use super::semaphore::Lock;

/// Open/closed barrier for coroutines on one event loop. Created open.
pub struct Gate {
    lock: Rc<Lock>,
}

impl Gate {
    pub fn new() -> Self {
        Gate {
            lock: Rc::new(Lock::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.lock.is_locked()
    }

    pub fn is_closed(&self) -> bool {
        self.lock.is_locked()
    }

    /// Open the gate, waking everyone parked in [`go_through`](Gate::go_through).
    /// A no-op when already open.
    pub fn open(&self) {
        if self.lock.is_locked() {
            self.lock.release();
        }
    }

    /// Close the gate. A no-op when already closed.
    pub fn close(&self) {
        if !self.lock.is_locked() {
            let closed = self.lock.try_acquire();
            debug_assert!(closed, "an open gate's lock always has its permit");
        }
    }

    /// Pass through the gate, parking while it is closed.
    ///
    /// Passing is non-consuming: the gate stays open behind the caller.
    /// Resolves to `false` only if the gate is destroyed while waiting. The
    /// non-blocking check is [`is_open`](Gate::is_open).
    pub fn go_through(&self) -> impl Future<Output = bool> + 'static {
        let lock = self.lock.clone();
        async move {
            if !lock.is_locked() {
                return true;
            }
            if !lock.acquire().await {
                return false;
            }
            lock.release();
            true
        }
    }

    /// Number of coroutines parked at the gate.
    pub fn waiting(&self) -> usize {
        self.lock.waiting()
    }
}

impl Default for Gate {
    fn default() -> Self {
        Gate::new()
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        // Coroutines still parked at the gate observe destruction.
        self.lock.close();
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("open", &self.is_open())
            .field("waiting", &self.waiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{run, until};
    use std::cell::Cell;
    use weft_eventloop::spawn;

    #[test]
    fn an_open_gate_is_free_to_pass() {
        run(async {
            let gate = Gate::new();
            assert!(gate.is_open());
            assert!(gate.go_through().await);
            // Non-consuming: still open.
            assert!(gate.is_open());
        });
    }

    #[test]
    fn open_and_close_are_idempotent() {
        run(async {
            let gate = Gate::new();
            gate.open();
            assert!(gate.is_open());
            gate.close();
            gate.close();
            assert!(gate.is_closed());
            gate.open();
            gate.open();
            assert!(gate.is_open());
        });
    }

    #[test]
    fn a_closed_gate_parks_until_reopened() {
        run(async {
            let gate = Rc::new(Gate::new());
            gate.close();

            let passed = Rc::new(Cell::new(0));
            for _ in 0..2 {
                let gate = gate.clone();
                let passed = passed.clone();
                spawn(async move {
                    assert!(gate.go_through().await);
                    passed.set(passed.get() + 1);
                });
            }
            {
                let gate = gate.clone();
                until(move || gate.waiting() == 2).await;
            }
            assert_eq!(passed.get(), 0);

            gate.open();
            {
                let passed = passed.clone();
                until(move || passed.get() == 2).await;
            }
            assert!(gate.is_open());
        });
    }

    #[test]
    fn destroying_a_closed_gate_reports_false() {
        run(async {
            let gate = Rc::new(Gate::new());
            gate.close();

            let result = Rc::new(Cell::new(None));
            {
                let gate = gate.clone();
                let result = result.clone();
                spawn(async move {
                    result.set(Some(gate.go_through().await));
                });
            }
            {
                let gate = gate.clone();
                until(move || gate.waiting() == 1).await;
            }

            drop(gate);
            {
                let result = result.clone();
                until(move || result.get().is_some()).await;
            }
            assert_eq!(result.get(), Some(false));
        });
    }
}
