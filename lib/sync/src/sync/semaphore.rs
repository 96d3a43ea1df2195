// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counting semaphore and its single-permit [`Lock`] specialization.
//!
//! A release never resumes waiters inline. It schedules one zero-delay drain
//! callback on the loop; when that callback runs it hands out as many permits
//! as the counter allows, in FIFO order. This keeps the releaser's view of
//! the semaphore consistent until it yields, and coalesces a burst of
//! releases into a single drain pass.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::Future;
use tracing::trace;

use weft_eventloop::{call_later, current_loop, expect_coroutine, CallbackHandle, CoroutineId};

/// A coroutine parked in a semaphore's waiter queue.
///
/// The queue holds only a weak reference; if the coroutine is torn down
/// without running its cleanup the drain simply skips the dead slot.
struct Waiter {
    coroutine: CoroutineId,
    /// `None` while parked, `Some(true)` once a permit was delivered,
    /// `Some(false)` once the semaphore was destroyed.
    outcome: Cell<Option<bool>>,
    waker: RefCell<Option<Waker>>,
}

struct Shared {
    initial: u32,
    counter: u32,
    waiters: VecDeque<Weak<Waiter>>,
    /// Pending deferred-resume callback, if one is scheduled.
    notified: Option<CallbackHandle>,
    closed: bool,
}

/// Counting semaphore with bounded capacity and FIFO waiters.
///
/// Affined to one event loop. The handle is the sole owner: dropping it wakes
/// every parked waiter with a `false` ("destroyed") result. Share it between
/// coroutines with `Rc<Semaphore>`.
pub struct Semaphore {
    shared: Rc<RefCell<Shared>>,
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits (its permanent capacity).
    ///
    /// # Panics
    /// If `permits` is zero.
    pub fn new(permits: u32) -> Self {
        assert!(permits >= 1, "a semaphore needs at least one permit");
        Semaphore {
            shared: Rc::new(RefCell::new(Shared {
                initial: permits,
                counter: permits,
                waiters: VecDeque::new(),
                notified: None,
                closed: false,
            })),
        }
    }

    /// Take one permit without blocking. Returns `false` if none is free.
    pub fn try_acquire(&self) -> bool {
        let mut shared = self.shared.borrow_mut();
        if shared.closed || shared.counter == 0 {
            return false;
        }
        shared.counter -= 1;
        true
    }

    /// Take one permit, parking the calling coroutine until one is free.
    ///
    /// Resolves to `true` once a permit was delivered, `false` if the
    /// semaphore was destroyed while waiting.
    pub fn acquire(&self) -> Acquire {
        Acquire {
            shared: self.shared.clone(),
            waiter: None,
        }
    }

    /// Take `permits` permits one at a time.
    ///
    /// Returns `false` immediately when `permits` exceeds the capacity.
    /// On failure part-way through, permits already taken are **not**
    /// returned; callers are expected to pair this with a full
    /// `release_many(permits)` regardless of the result.
    pub fn acquire_many(&self, permits: u32) -> impl Future<Output = bool> + 'static {
        let shared = self.shared.clone();
        async move {
            if permits > shared.borrow().initial {
                return false;
            }
            for _ in 0..permits {
                let acquired = Acquire {
                    shared: shared.clone(),
                    waiter: None,
                }
                .await;
                if !acquired {
                    return false;
                }
            }
            true
        }
    }

    /// Non-blocking [`acquire_many`](Semaphore::acquire_many); the same
    /// partial-failure contract applies.
    pub fn try_acquire_many(&self, permits: u32) -> bool {
        if permits > self.shared.borrow().initial {
            return false;
        }
        for _ in 0..permits {
            if !self.try_acquire() {
                return false;
            }
        }
        true
    }

    /// Take one permit and hold it in an RAII guard that releases on drop.
    ///
    /// `None` means the semaphore was destroyed while waiting.
    pub fn acquire_scoped(&self) -> impl Future<Output = Option<SemaphoreGuard>> + 'static {
        let shared = self.shared.clone();
        async move {
            let acquired = Acquire {
                shared: shared.clone(),
                waiter: None,
            }
            .await;
            acquired.then(|| SemaphoreGuard { shared })
        }
    }

    /// Return one permit. See [`release_many`](Semaphore::release_many).
    pub fn release(&self) {
        release_permits(&self.shared, 1);
    }

    /// Return `permits` permits. The counter saturates and is clamped to the
    /// capacity; if coroutines are parked and no drain is pending, one is
    /// scheduled to run as soon as possible.
    pub fn release_many(&self, permits: u32) {
        release_permits(&self.shared, permits);
    }

    /// Whether no permit is currently free.
    pub fn is_locked(&self) -> bool {
        self.shared.borrow().counter == 0
    }

    /// Whether at least one permit is out.
    pub fn is_used(&self) -> bool {
        let shared = self.shared.borrow();
        shared.counter < shared.initial
    }

    /// Number of coroutines parked in the waiter queue.
    pub fn waiting(&self) -> usize {
        self.shared.borrow().waiters.len()
    }

    /// Wake all waiters with the "destroyed" result and refuse new permits.
    /// Used by primitives that embed locks; dropping the handle does the same.
    pub(crate) fn close(&self) {
        schedule_destroy(&self.shared);
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        schedule_destroy(&self.shared);
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Semaphore")
            .field("permits", &shared.counter)
            .field("capacity", &shared.initial)
            .field("waiting", &shared.waiters.len())
            .finish()
    }
}

/// A held permit; returned to the semaphore on drop.
pub struct SemaphoreGuard {
    shared: Rc<RefCell<Shared>>,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        release_permits(&self.shared, 1);
    }
}

impl fmt::Debug for SemaphoreGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreGuard").finish()
    }
}

/// Future returned by [`Semaphore::acquire`].
///
/// Dropping it at the suspension point withdraws the waiter from the queue;
/// a permit that was already delivered but never observed is handed back, so
/// cancellation can never leak permits.
pub struct Acquire {
    shared: Rc<RefCell<Shared>>,
    waiter: Option<Rc<Waiter>>,
}

impl Future for Acquire {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();

        if let Some(waiter) = this.waiter.take() {
            return match waiter.outcome.get() {
                Some(granted) => Poll::Ready(granted),
                None => {
                    *waiter.waker.borrow_mut() = Some(cx.waker().clone());
                    this.waiter = Some(waiter);
                    Poll::Pending
                }
            };
        }

        let mut shared = this.shared.borrow_mut();
        if shared.closed {
            return Poll::Ready(false);
        }
        if shared.counter > 0 {
            shared.counter -= 1;
            return Poll::Ready(true);
        }

        let coroutine = expect_coroutine("Semaphore::acquire");
        let waiter = Rc::new(Waiter {
            coroutine,
            outcome: Cell::new(None),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        shared.waiters.push_back(Rc::downgrade(&waiter));
        drop(shared);
        trace!(coroutine = %coroutine, "coroutine parked on semaphore");
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        match waiter.outcome.get() {
            // Still queued: withdraw before anything can resume the slot.
            None => remove_waiter(&self.shared, &waiter),
            // A permit arrived but was never observed; hand it back so it is
            // not lost with the cancelled coroutine.
            Some(true) => release_permits(&self.shared, 1),
            Some(false) => {}
        }
    }
}

fn remove_waiter(shared: &Rc<RefCell<Shared>>, waiter: &Rc<Waiter>) {
    shared
        .borrow_mut()
        .waiters
        .retain(|slot| !std::ptr::eq(slot.as_ptr(), Rc::as_ptr(waiter)));
}

fn release_permits(shared: &Rc<RefCell<Shared>>, permits: u32) {
    if permits == 0 {
        return;
    }
    let needs_drain = {
        let mut state = shared.borrow_mut();
        if state.closed {
            return;
        }
        state.counter = state.counter.saturating_add(permits).min(state.initial);
        !state.waiters.is_empty() && state.notified.is_none()
    };
    if !needs_drain {
        return;
    }
    if current_loop().is_some() {
        let pending = shared.clone();
        let callback = call_later(Duration::ZERO, move || resume_waiters(&pending, false));
        shared.borrow_mut().notified = Some(callback);
    } else {
        // No loop left to defer to (teardown); wake inline so nothing hangs.
        resume_waiters(shared, false);
    }
}

/// The deferred-resume drain.
///
/// In normal mode it hands out permits while the counter allows; in drain
/// mode (destruction) it ignores the counter and resumes every remaining
/// waiter once with the "destroyed" outcome.
fn resume_waiters(shared: &Rc<RefCell<Shared>>, destroying: bool) {
    loop {
        let next = {
            let mut state = shared.borrow_mut();
            if !destroying && state.counter == 0 {
                break;
            }
            let Some(slot) = state.waiters.pop_front() else {
                break;
            };
            match slot.upgrade() {
                Some(waiter) => {
                    if !destroying {
                        state.counter -= 1;
                    }
                    Some(waiter)
                }
                None => None,
            }
        };
        let Some(waiter) = next else {
            trace!("skipping a waiter whose coroutine is gone");
            continue;
        };
        trace!(coroutine = %waiter.coroutine, destroying, "resuming waiter");
        waiter.outcome.set(Some(!destroying));
        if let Some(waker) = waiter.waker.borrow_mut().take() {
            waker.wake();
        };
    }
    if !destroying {
        shared.borrow_mut().notified = None;
    }
}

fn schedule_destroy(shared: &Rc<RefCell<Shared>>) {
    let (pending, has_waiters) = {
        let mut state = shared.borrow_mut();
        if state.closed {
            return;
        }
        state.closed = true;
        (state.notified.take(), !state.waiters.is_empty())
    };
    // A drain scheduled by an earlier release must not win over destruction:
    // every waiter still queued observes "destroyed".
    if let Some(callback) = pending {
        callback.cancel();
    }
    if !has_waiters {
        return;
    }
    if current_loop().is_some() {
        let doomed = shared.clone();
        call_later(Duration::ZERO, move || resume_waiters(&doomed, true));
    } else {
        resume_waiters(shared, true);
    }
}

/// Mutual-exclusion lock: a semaphore with a single permit.
pub struct Lock {
    semaphore: Semaphore,
}

impl Lock {
    pub fn new() -> Self {
        Lock {
            semaphore: Semaphore::new(1),
        }
    }

    /// See [`Semaphore::acquire`].
    pub fn acquire(&self) -> Acquire {
        self.semaphore.acquire()
    }

    /// See [`Semaphore::try_acquire`].
    pub fn try_acquire(&self) -> bool {
        self.semaphore.try_acquire()
    }

    pub fn release(&self) {
        self.semaphore.release()
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.is_locked()
    }

    pub fn waiting(&self) -> usize {
        self.semaphore.waiting()
    }

    pub(crate) fn close(&self) {
        self.semaphore.close()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Lock::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("locked", &self.is_locked())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Take one permit from the first semaphore that has one free, without
/// blocking.
pub fn try_acquire_any(semaphores: &[Rc<Semaphore>]) -> Option<Rc<Semaphore>> {
    semaphores
        .iter()
        .find(|semaphore| semaphore.try_acquire())
        .cloned()
}

/// Take one permit from whichever semaphore can deliver one first.
///
/// If none has a free permit the coroutine parks on all of them; the first
/// delivery wins and every other enqueue is withdrawn (also on
/// cancellation). Resolves to the winning semaphore, or `None` when one of
/// them was destroyed while waiting.
pub fn acquire_any(semaphores: &[Rc<Semaphore>]) -> AcquireAny {
    AcquireAny {
        semaphores: semaphores.to_vec(),
        waiters: Vec::new(),
    }
}

/// Future returned by [`acquire_any`].
pub struct AcquireAny {
    semaphores: Vec<Rc<Semaphore>>,
    waiters: Vec<(Rc<RefCell<Shared>>, Rc<Waiter>)>,
}

impl Future for AcquireAny {
    type Output = Option<Rc<Semaphore>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.waiters.is_empty() {
            if let Some(winner) = try_acquire_any(&this.semaphores) {
                return Poll::Ready(Some(winner));
            }
            let coroutine = expect_coroutine("acquire_any");
            for semaphore in &this.semaphores {
                let mut shared = semaphore.shared.borrow_mut();
                if shared.closed {
                    continue;
                }
                let waiter = Rc::new(Waiter {
                    coroutine,
                    outcome: Cell::new(None),
                    waker: RefCell::new(Some(cx.waker().clone())),
                });
                shared.waiters.push_back(Rc::downgrade(&waiter));
                drop(shared);
                this.waiters.push((semaphore.shared.clone(), waiter));
            }
            if this.waiters.is_empty() {
                // Nothing left alive to wait on.
                return Poll::Ready(None);
            }
            return Poll::Pending;
        }

        let resolved = this
            .waiters
            .iter()
            .any(|(_, waiter)| waiter.outcome.get().is_some());
        if !resolved {
            for (_, waiter) in &this.waiters {
                *waiter.waker.borrow_mut() = Some(cx.waker().clone());
            }
            return Poll::Pending;
        }

        // Exactly one delivery is expected, but a burst of releases can grant
        // more than one before this coroutine runs; surplus permits go back.
        let mut winner = None;
        for (index, (shared, waiter)) in this.waiters.iter().enumerate() {
            match waiter.outcome.get() {
                Some(true) if winner.is_none() => winner = Some(index),
                Some(true) => release_permits(shared, 1),
                Some(false) => {}
                None => remove_waiter(shared, waiter),
            }
        }
        let winner = winner.map(|index| {
            this.semaphores
                .iter()
                .find(|semaphore| Rc::ptr_eq(&semaphore.shared, &this.waiters[index].0))
                .cloned()
                .expect("winning waiter belongs to one of the semaphores")
        });
        this.waiters.clear();
        Poll::Ready(winner)
    }
}

impl Drop for AcquireAny {
    fn drop(&mut self) {
        for (shared, waiter) in self.waiters.drain(..) {
            match waiter.outcome.get() {
                None => remove_waiter(&shared, &waiter),
                Some(true) => release_permits(&shared, 1),
                Some(false) => {}
            }
        }
    }
}
