// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-thread sticky event.
//!
//! [`ThreadEvent`] is the one primitive that may be shared between OS threads
//! and between event loops. It serves three waiter populations:
//!
//! 1. Coroutines on an event loop park on that loop's shared per-event
//!    [`Condition`]; a setter on a foreign thread reaches them by marshalling
//!    a "notify" callback onto their loop, so the non-`Send` condition never
//!    leaves its thread.
//! 2. Plain threads without a loop block on an OS condvar.
//! 3. Linked peer events are set transitively.
//!
//! Waiters hold their own strong reference to the shared core, so the public
//! handle can be dropped while they are parked; the drop marks the core
//! closed and performs one final notify, and every waiter returns the flag
//! as it stands (`false` when the event was never set).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Future;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use weft_eventloop::{current_loop, LoopHandle};

use super::condition::Condition;

/// One event loop with coroutines parked on this event.
///
/// The loop's shared [`Condition`] lives in that thread's local registry;
/// the hold itself carries only `Send` data.
struct Hold {
    eventloop: LoopHandle,
    waiters: usize,
}

struct Inner {
    holds: Vec<Hold>,
    link_to: Vec<Weak<Core>>,
    link_from: Vec<Weak<Core>>,
}

struct Core {
    id: u64,
    /// Sticky flag; only the false→true edge notifies.
    flag: AtomicBool,
    /// Set by the handle's drop; waiters treat it as the termination signal.
    closed: AtomicBool,
    /// Plain-thread waiters currently blocked on the condvar.
    condvar_waiters: AtomicUsize,
    /// All blocked waiters, cooperative and classical.
    blocked: AtomicUsize,
    inner: Mutex<Inner>,
    condvar: Condvar,
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// This loop's shared conditions for cross-thread events, keyed by event
    /// id. An entry exists exactly while the loop has waiters on the event.
    static LOOP_CONDITIONS: RefCell<HashMap<u64, Rc<Condition>>> =
        RefCell::new(HashMap::new());
}

/// Sticky flag that can be set, cleared and awaited from any thread.
///
/// Share it with `Arc<ThreadEvent>`; when the last reference drops, every
/// parked waiter is woken and observes the final flag value.
pub struct ThreadEvent {
    core: Arc<Core>,
}

impl ThreadEvent {
    pub fn new() -> Self {
        ThreadEvent {
            core: Arc::new(Core {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                flag: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                condvar_waiters: AtomicUsize::new(0),
                blocked: AtomicUsize::new(0),
                inner: Mutex::new(Inner {
                    holds: Vec::new(),
                    link_to: Vec::new(),
                    link_from: Vec::new(),
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Set the flag and wake every waiter. Further sets are no-ops until
    /// [`clear`](ThreadEvent::clear); linked peers are set transitively.
    pub fn set(&self) {
        set_core(&self.core);
    }

    /// Reset the flag. Not propagated across links.
    pub fn clear(&self) {
        self.core.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.core.flag.load(Ordering::Acquire)
    }

    /// Number of blocked waiters across all threads and loops.
    pub fn waiting(&self) -> usize {
        self.core.blocked.load(Ordering::Acquire)
    }

    /// Cooperative wait; must run on an event-loop coroutine.
    ///
    /// Resolves to the flag value: `true` once set, `false` when the event
    /// is destroyed while the flag is clear.
    pub fn wait(&self) -> impl Future<Output = bool> + 'static {
        let core = self.core.clone();
        async move {
            if core.flag.load(Ordering::Acquire) {
                return true;
            }
            let eventloop = current_loop().expect(
                "ThreadEvent::wait needs an event loop; plain threads use wait_blocking",
            );
            let condition = register_hold(&core, &eventloop);
            let _cleanup = HoldCleanup {
                core: core.clone(),
                eventloop,
            };
            let mut flag = core.flag.load(Ordering::Acquire);
            while !flag && !core.closed.load(Ordering::Acquire) {
                if !condition.wait().await {
                    break;
                }
                flag = core.flag.load(Ordering::Acquire);
            }
            flag
        }
    }

    /// Classical wait for threads that run no event loop.
    ///
    /// # Panics
    /// When called on an event-loop thread: an OS-level wait there would
    /// freeze the loop and could never be woken by it.
    pub fn wait_blocking(&self) -> bool {
        let mut flag = self.core.flag.load(Ordering::Acquire);
        if flag {
            return true;
        }
        assert!(
            current_loop().is_none(),
            "ThreadEvent::wait_blocking would freeze this thread's event loop"
        );
        let core = &self.core;
        let mut inner = core.inner.lock();
        core.condvar_waiters.fetch_add(1, Ordering::AcqRel);
        core.blocked.fetch_add(1, Ordering::AcqRel);
        loop {
            flag = core.flag.load(Ordering::Acquire);
            if flag || core.closed.load(Ordering::Acquire) {
                break;
            }
            core.condvar.wait(&mut inner);
        }
        core.condvar_waiters.fetch_sub(1, Ordering::AcqRel);
        core.blocked.fetch_sub(1, Ordering::AcqRel);
        flag
    }

    /// Make `self.set()` also set `other`, until [`unlink`](ThreadEvent::unlink).
    pub fn link(&self, other: &ThreadEvent) {
        if Arc::ptr_eq(&self.core, &other.core) {
            return;
        }
        // The two locks are taken one after the other, never nested.
        self.core
            .inner
            .lock()
            .link_to
            .push(Arc::downgrade(&other.core));
        other
            .core
            .inner
            .lock()
            .link_from
            .push(Arc::downgrade(&self.core));
    }

    /// Remove one link established with [`link`](ThreadEvent::link).
    pub fn unlink(&self, other: &ThreadEvent) {
        remove_link(&mut self.core.inner.lock().link_to, &other.core);
        remove_link(&mut other.core.inner.lock().link_from, &self.core);
    }
}

impl Default for ThreadEvent {
    fn default() -> Self {
        ThreadEvent::new()
    }
}

impl Drop for ThreadEvent {
    fn drop(&mut self) {
        self.core.closed.store(true, Ordering::Release);
        // One final notify so every parked waiter observes termination.
        notify_core(&self.core);
        let (from, to) = {
            let mut inner = self.core.inner.lock();
            (
                std::mem::take(&mut inner.link_from),
                std::mem::take(&mut inner.link_to),
            )
        };
        for peer in from.iter().filter_map(Weak::upgrade) {
            remove_link(&mut peer.inner.lock().link_to, &self.core);
        }
        for peer in to.iter().filter_map(Weak::upgrade) {
            remove_link(&mut peer.inner.lock().link_from, &self.core);
        }
    }
}

impl fmt::Debug for ThreadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEvent")
            .field("set", &self.is_set())
            .field("waiting", &self.waiting())
            .finish()
    }
}

fn set_core(core: &Arc<Core>) {
    if core.flag.swap(true, Ordering::AcqRel) {
        return;
    }
    notify_core(core);
    let peers = {
        core.inner
            .lock()
            .link_to
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>()
    };
    // Propagate outside the lock; the sticky-flag check terminates cycles.
    for peer in peers {
        set_core(&peer);
    }
}

/// Wake every waiter population once.
///
/// Holds on the current loop are notified directly; foreign loops get a
/// marshalled callback carrying only the event id. Dead loops are dropped
/// from the hold list on the way.
fn notify_core(core: &Arc<Core>) {
    let current = current_loop();
    {
        let mut inner = core.inner.lock();
        let id = core.id;
        inner.holds.retain(|hold| {
            if current.as_ref() == Some(&hold.eventloop) {
                notify_loop_condition(id);
                true
            } else {
                let marshalled = hold
                    .eventloop
                    .call_later_thread_safe(Duration::ZERO, move || notify_loop_condition(id));
                if marshalled.is_err() {
                    trace!("dropping hold for a dead event loop");
                }
                marshalled.is_ok()
            }
        });
    }
    // The mutex round-trip above orders this wake against a waiter that read
    // a clear flag and is entering the condvar.
    if core.condvar_waiters.load(Ordering::Acquire) > 0 {
        core.condvar.notify_all();
    }
}

/// Runs on the loop that owns the condition, directly or marshalled.
fn notify_loop_condition(id: u64) {
    let condition = LOOP_CONDITIONS.with(|map| map.borrow().get(&id).cloned());
    if let Some(condition) = condition {
        condition.notify_all();
    }
}

fn register_hold(core: &Arc<Core>, eventloop: &LoopHandle) -> Rc<Condition> {
    let condition = LOOP_CONDITIONS.with(|map| {
        map.borrow_mut()
            .entry(core.id)
            .or_insert_with(|| Rc::new(Condition::new()))
            .clone()
    });
    let mut inner = core.inner.lock();
    match inner
        .holds
        .iter_mut()
        .find(|hold| hold.eventloop == *eventloop)
    {
        Some(hold) => hold.waiters += 1,
        None => inner.holds.push(Hold {
            eventloop: eventloop.clone(),
            waiters: 1,
        }),
    }
    core.blocked.fetch_add(1, Ordering::AcqRel);
    condition
}

/// Runs when a cooperative waiter leaves, normally or cancelled: drops the
/// hold and the loop's registry entry once the loop has no waiters left.
struct HoldCleanup {
    core: Arc<Core>,
    eventloop: LoopHandle,
}

impl Drop for HoldCleanup {
    fn drop(&mut self) {
        {
            let mut inner = self.core.inner.lock();
            if let Some(position) = inner
                .holds
                .iter()
                .position(|hold| hold.eventloop == self.eventloop)
            {
                inner.holds[position].waiters -= 1;
                if inner.holds[position].waiters == 0 {
                    inner.holds.remove(position);
                    let id = self.core.id;
                    LOOP_CONDITIONS.with(|map| {
                        map.borrow_mut().remove(&id);
                    });
                }
            }
        }
        self.core.blocked.fetch_sub(1, Ordering::AcqRel);
    }
}

fn remove_link(links: &mut Vec<Weak<Core>>, target: &Arc<Core>) {
    if let Some(position) = links
        .iter()
        .position(|link| std::ptr::eq(link.as_ptr(), Arc::as_ptr(target)))
    {
        links.remove(position);
    }
}
