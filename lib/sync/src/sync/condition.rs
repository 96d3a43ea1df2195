// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Condition variable built from per-waiter single-use locks.
//!
//! Cooperative scheduling removes the need for the classical external mutex:
//! nothing can interleave between suspension points, so each waiter just
//! materializes a fresh single-permit lock, pre-acquires it, queues it, and
//! re-acquires it to park. A notifier releases the queued lock to wake the
//! waiter.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use futures::Future;

use super::semaphore::Lock;

struct Inner {
    waiters: VecDeque<Rc<Lock>>,
    closed: bool,
}

/// Wait/notify rendezvous for coroutines on one event loop.
pub struct Condition {
    inner: Rc<RefCell<Inner>>,
}

impl Condition {
    pub fn new() -> Self {
        Condition {
            inner: Rc::new(RefCell::new(Inner {
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Park until notified.
    ///
    /// Resolves to `true` when a notify woke the caller, `false` when the
    /// condition was destroyed. Cancellation at the suspension point
    /// withdraws the waiter as if it never enqueued.
    pub fn wait(&self) -> impl Future<Output = bool> + 'static {
        let inner = self.inner.clone();
        async move {
            if inner.borrow().closed {
                return false;
            }
            let waiter = Rc::new(Lock::new());
            if !waiter.try_acquire() {
                return false;
            }
            inner.borrow_mut().waiters.push_back(waiter.clone());

            let mut cleanup = Cleanup {
                inner: inner.clone(),
                waiter: waiter.clone(),
                armed: true,
            };
            // The lock is at zero permits now, so this parks until a notify
            // releases it (or destruction closes it).
            let notified = waiter.acquire().await;
            cleanup.armed = false;

            if notified {
                waiter.release();
            }
            remove_waiter(&inner, &waiter);
            notified
        }
    }

    /// Wake up to `count` waiters, oldest first.
    pub fn notify(&self, count: usize) {
        let popped: Vec<Rc<Lock>> = {
            let mut inner = self.inner.borrow_mut();
            (0..count).map_while(|_| inner.waiters.pop_front()).collect()
        };
        for waiter in popped {
            waiter.release();
        }
    }

    /// Wake every parked waiter.
    pub fn notify_all(&self) {
        self.notify(self.waiting());
    }

    /// Number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Wake every waiter with the destroyed result and refuse new waits.
    pub(crate) fn close(&self) {
        let drained: Vec<Rc<Lock>> = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.waiters.drain(..).collect()
        };
        for waiter in drained {
            waiter.close();
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::new()
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("waiting", &self.waiting())
            .finish()
    }
}

fn remove_waiter(inner: &Rc<RefCell<Inner>>, waiter: &Rc<Lock>) {
    inner
        .borrow_mut()
        .waiters
        .retain(|queued| !Rc::ptr_eq(queued, waiter));
}

/// Cancellation cleanup: put the waiter lock back the way the notifier
/// expects and withdraw from the queue before the cancellation propagates.
struct Cleanup {
    inner: Rc<RefCell<Inner>>,
    waiter: Rc<Lock>,
    armed: bool,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.waiter.release();
        remove_waiter(&self.inner, &self.waiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{run, until};
    use weft_eventloop::spawn;

    fn spawn_waiters(
        condition: &Rc<Condition>,
        count: usize,
    ) -> Rc<RefCell<Vec<(usize, bool)>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for index in 0..count {
            let condition = condition.clone();
            let log = log.clone();
            spawn(async move {
                let notified = condition.wait().await;
                log.borrow_mut().push((index, notified));
            });
        }
        log
    }

    #[test]
    fn notify_wakes_the_oldest_waiters_in_order() {
        run(async {
            let condition = Rc::new(Condition::new());
            let log = spawn_waiters(&condition, 3);
            {
                let condition = condition.clone();
                until(move || condition.waiting() == 3).await;
            }

            condition.notify(2);
            {
                let log = log.clone();
                until(move || log.borrow().len() == 2).await;
            }
            assert_eq!(*log.borrow(), [(0, true), (1, true)]);
            assert_eq!(condition.waiting(), 1);

            condition.notify_all();
            {
                let log = log.clone();
                until(move || log.borrow().len() == 3).await;
            }
            assert_eq!(log.borrow()[2], (2, true));
            assert_eq!(condition.waiting(), 0);
        });
    }

    #[test]
    fn notify_beyond_the_queue_is_harmless() {
        run(async {
            let condition = Rc::new(Condition::new());
            condition.notify(5);
            let log = spawn_waiters(&condition, 1);
            {
                let condition = condition.clone();
                until(move || condition.waiting() == 1).await;
            }
            condition.notify(5);
            {
                let log = log.clone();
                until(move || log.borrow().len() == 1).await;
            }
            assert_eq!(*log.borrow(), [(0, true)]);
        });
    }

    #[test]
    fn destruction_reports_false_to_every_waiter() {
        run(async {
            let condition = Rc::new(Condition::new());
            let log = spawn_waiters(&condition, 2);
            {
                let condition = condition.clone();
                until(move || condition.waiting() == 2).await;
            }

            drop(condition);
            {
                let log = log.clone();
                until(move || log.borrow().len() == 2).await;
            }
            assert_eq!(*log.borrow(), [(0, false), (1, false)]);
        });
    }

    #[test]
    fn cancelled_waiter_withdraws_cleanly() {
        run(async {
            let condition = Rc::new(Condition::new());
            let log = spawn_waiters(&condition, 1);

            let doomed = spawn({
                let condition = condition.clone();
                async move {
                    condition.wait().await;
                    unreachable!("aborted while parked");
                }
            });
            {
                let condition = condition.clone();
                until(move || condition.waiting() == 2).await;
            }

            doomed.abort();
            {
                let condition = condition.clone();
                until(move || condition.waiting() == 1).await;
            }

            // The surviving waiter is still first in line.
            condition.notify(1);
            {
                let log = log.clone();
                until(move || log.borrow().len() == 1).await;
            }
            assert_eq!(*log.borrow(), [(0, true)]);
        });
    }

    #[test]
    fn notify_then_immediate_destruction_still_delivers() {
        run(async {
            let condition = Rc::new(Condition::new());
            let log = spawn_waiters(&condition, 1);
            {
                let condition = condition.clone();
                until(move || condition.waiting() == 1).await;
            }

            condition.notify(1);
            drop(condition);
            {
                let log = log.clone();
                until(move || log.borrow().len() == 1).await;
            }
            // The waiter was already popped by the notify, so destruction
            // does not turn its result into false.
            assert_eq!(*log.borrow(), [(0, true)]);
        });
    }
}
