// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sticky one-shot event with set-propagation links.
//!
//! Events can be linked into a directed graph: setting an event sets every
//! event it links to, transitively. The links are bidirectional back-pointers
//! so destruction leaves peers consistent, and the already-set short-circuit
//! keeps cyclic graphs from recursing forever. `clear` is local and never
//! propagates.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use futures::Future;
use tracing::debug;

use super::condition::Condition;

struct Inner {
    flag: bool,
    condition: Condition,
    link_to: Vec<Weak<RefCell<Inner>>>,
    link_from: Vec<Weak<RefCell<Inner>>>,
}

/// Sticky flag coroutines can wait on.
pub struct Event {
    inner: Rc<RefCell<Inner>>,
}

impl Event {
    pub fn new() -> Self {
        Event {
            inner: Rc::new(RefCell::new(Inner {
                flag: false,
                condition: Condition::new(),
                link_to: Vec::new(),
                link_from: Vec::new(),
            })),
        }
    }

    /// Set the flag, wake all waiters, and propagate through the link graph.
    /// A no-op when already set.
    pub fn set(&self) {
        set_inner(&self.inner);
    }

    /// Reset the flag. Linked events are untouched.
    pub fn clear(&self) {
        self.inner.borrow_mut().flag = false;
    }

    pub fn is_set(&self) -> bool {
        self.inner.borrow().flag
    }

    /// Number of coroutines parked in [`wait`](Event::wait).
    pub fn waiting(&self) -> usize {
        self.inner.borrow().condition.waiting()
    }

    /// Park until the flag is set.
    ///
    /// Resolves to `true` once set, `false` if the event is destroyed first.
    pub fn wait(&self) -> impl Future<Output = bool> + 'static {
        let inner = self.inner.clone();
        async move {
            loop {
                let wait = {
                    let inner = inner.borrow();
                    if inner.flag {
                        return true;
                    }
                    inner.condition.wait()
                };
                if !wait.await {
                    debug!("event destroyed while a coroutine was waiting");
                    return false;
                }
            }
        }
    }

    /// Make `self.set()` also set `other`, until [`unlink`](Event::unlink).
    pub fn link(&self, other: &Event) {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        self.inner
            .borrow_mut()
            .link_to
            .push(Rc::downgrade(&other.inner));
        other
            .inner
            .borrow_mut()
            .link_from
            .push(Rc::downgrade(&self.inner));
    }

    /// Remove one link established with [`link`](Event::link).
    pub fn unlink(&self, other: &Event) {
        remove_link(&mut self.inner.borrow_mut().link_to, &other.inner);
        remove_link(&mut other.inner.borrow_mut().link_from, &self.inner);
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        let (from, to) = {
            let mut inner = self.inner.borrow_mut();
            // Waiters observe destruction, not a set.
            inner.condition.close();
            (
                std::mem::take(&mut inner.link_from),
                std::mem::take(&mut inner.link_to),
            )
        };
        for peer in from.iter().filter_map(Weak::upgrade) {
            remove_link(&mut peer.borrow_mut().link_to, &self.inner);
        }
        for peer in to.iter().filter_map(Weak::upgrade) {
            remove_link(&mut peer.borrow_mut().link_from, &self.inner);
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("set", &self.is_set())
            .field("waiting", &self.waiting())
            .finish()
    }
}

fn set_inner(inner: &Rc<RefCell<Inner>>) {
    let peers = {
        let mut inner = inner.borrow_mut();
        if inner.flag {
            return;
        }
        inner.flag = true;
        inner.condition.notify_all();
        inner
            .link_to
            .iter()
            .filter_map(Weak::upgrade)
            .collect::<Vec<_>>()
    };
    // Recurse outside the borrow; the already-set check above terminates
    // cycles.
    for peer in peers {
        set_inner(&peer);
    }
}

fn remove_link(links: &mut Vec<Weak<RefCell<Inner>>>, target: &Rc<RefCell<Inner>>) {
    if let Some(position) = links
        .iter()
        .position(|link| std::ptr::eq(link.as_ptr(), Rc::as_ptr(target)))
    {
        links.remove(position);
    }
}

/// An [`Event`] that carries a value to its waiters.
///
/// `send` stores the value and sets the event; every waiter observes the
/// same value. `None` from [`wait`](ValueEvent::wait) means the event was
/// destroyed unset.
pub struct ValueEvent<T> {
    event: Event,
    value: Rc<RefCell<Option<T>>>,
}

impl<T: Clone + 'static> ValueEvent<T> {
    pub fn new() -> Self {
        ValueEvent {
            event: Event::new(),
            value: Rc::new(RefCell::new(None)),
        }
    }

    pub fn send(&self, value: T) {
        *self.value.borrow_mut() = Some(value);
        self.event.set();
    }

    pub fn wait(&self) -> impl Future<Output = Option<T>> + 'static {
        let wait = self.event.wait();
        let value = self.value.clone();
        async move {
            if wait.await {
                value.borrow().clone()
            } else {
                None
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.event.is_set()
    }

    /// Reset the event and drop the stored value.
    pub fn clear(&self) {
        self.event.clear();
        *self.value.borrow_mut() = None;
    }

    /// Take the stored value out, leaving the flag as-is.
    pub fn take(&self) -> Option<T> {
        self.value.borrow_mut().take()
    }
}

impl<T: Clone + 'static> Default for ValueEvent<T> {
    fn default() -> Self {
        ValueEvent::new()
    }
}
