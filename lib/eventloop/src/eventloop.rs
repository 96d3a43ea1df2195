// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The event loop: a current-thread tokio runtime driving a `LocalSet`.
//!
//! One loop owns one OS thread. Work arrives three ways: coroutines spawned
//! from the loop thread, callbacks deferred with [`call_later`], and callbacks
//! marshalled from foreign threads through a [`LoopHandle`]. Marshalled
//! callbacks are drained by a dispatcher task so they always execute on the
//! loop's own thread, never on the caller's.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use futures::Future;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::LoopConfig;
use crate::coroutine;

/// A callback travelling from a foreign thread to its target loop.
struct ScheduledCall {
    delay: Duration,
    callback: Box<dyn FnOnce() + Send + 'static>,
}

/// The target loop has shut down; the callback was not delivered.
#[derive(Debug, thiserror::Error)]
#[error("event loop is no longer running")]
pub struct LoopClosed;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// The event loop owning the current thread, if any.
pub fn current_loop() -> Option<LoopHandle> {
    CURRENT_LOOP.with(|current| current.borrow().clone())
}

struct LoopShared {
    id: u64,
    remote: mpsc::UnboundedSender<ScheduledCall>,
}

/// Cheap cloneable reference to an event loop, usable from any thread.
///
/// A handle does not keep the loop running; once the loop returns from
/// [`EventLoop::block_on`] the handle reports dead and refuses callbacks.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Stable identifier of the loop, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the loop is still able to accept callbacks.
    pub fn is_alive(&self) -> bool {
        !self.shared.remote.is_closed()
    }

    /// Schedule `callback` to run on the loop's thread after `delay`.
    ///
    /// Safe to call from any thread. The callback executes in event-loop
    /// context (`current_coroutine()` is `None` inside it).
    pub fn call_later_thread_safe<F>(&self, delay: Duration, callback: F) -> Result<(), LoopClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .remote
            .send(ScheduledCall {
                delay,
                callback: Box::new(callback),
            })
            .map_err(|_| LoopClosed)
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for LoopHandle {}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("id", &self.shared.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Cancellation handle for a callback scheduled with [`call_later`].
#[derive(Debug)]
pub struct CallbackHandle {
    abort: tokio::task::AbortHandle,
}

impl CallbackHandle {
    /// Remove the callback if it has not fired yet; otherwise a no-op.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Schedule `callback` on the current loop after `delay`.
///
/// A zero delay means "as soon as possible": after everything already queued,
/// before anything scheduled later. Must be called on a running event loop.
pub fn call_later<F>(delay: Duration, callback: F) -> CallbackHandle
where
    F: FnOnce() + 'static,
{
    let task = tokio::task::spawn_local(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        callback();
    });
    CallbackHandle {
        abort: task.abort_handle(),
    }
}

/// A single-threaded cooperative scheduler bound to one OS thread.
pub struct EventLoop {
    runtime: tokio::runtime::Runtime,
    local: LocalSet,
    handle: LoopHandle,
    remote_rx: mpsc::UnboundedReceiver<ScheduledCall>,
    cancel: CancellationToken,
    config: LoopConfig,
}

impl EventLoop {
    /// Build a loop with default settings.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    /// Build a loop configured from the environment.
    /// See [`LoopConfig::from_settings`].
    pub fn from_settings() -> anyhow::Result<Self> {
        Self::with_config(LoopConfig::from_settings()?)
    }

    pub fn with_config(config: LoopConfig) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .context("failed to build the event loop runtime")?;
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let handle = LoopHandle {
            shared: Arc::new(LoopShared {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                remote: remote_tx,
            }),
        };
        Ok(EventLoop {
            runtime,
            local: LocalSet::new(),
            handle,
            remote_rx,
            cancel: CancellationToken::new(),
            config,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run the loop until `future` completes, then shut it down.
    ///
    /// The future runs as a coroutine; coroutines it spawns and callbacks it
    /// schedules are driven alongside it. On return every [`LoopHandle`]
    /// reports dead.
    pub fn block_on<F: Future>(self, future: F) -> F::Output {
        let EventLoop {
            runtime,
            local,
            handle,
            remote_rx,
            cancel,
            config,
        } = self;
        let _enter = EnterLoop::new(handle);
        local.block_on(&runtime, async move {
            let dispatcher = tokio::task::spawn_local(dispatch_remote_calls(
                remote_rx,
                cancel.clone(),
                config.max_callback_burst,
            ));
            let output = coroutine::wrap(future).await;
            cancel.cancel();
            let _ = dispatcher.await;
            output
        })
    }

    /// Run a loop on a dedicated, named OS thread.
    ///
    /// `f` is invoked on the new thread, inside the loop, to build the main
    /// future; the thread exits when that future completes.
    pub fn spawn_thread<F, Fut>(f: F) -> anyhow::Result<LoopThread>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self::spawn_thread_with_config(LoopConfig::default(), f)
    }

    pub fn spawn_thread_with_config<F, Fut>(config: LoopConfig, f: F) -> anyhow::Result<LoopThread>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel::<anyhow::Result<LoopHandle>>();
        let join = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let eventloop = match EventLoop::with_config(config) {
                    Ok(eventloop) => eventloop,
                    Err(err) => {
                        let _ = handle_tx.send(Err(err));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(eventloop.handle()));
                eventloop.block_on(async move { f().await });
                trace!("event loop thread exiting");
            })
            .context("failed to spawn the event loop thread")?;
        let handle = handle_rx
            .recv()
            .context("event loop thread exited before reporting its handle")??;
        Ok(LoopThread {
            handle,
            join: Some(join),
        })
    }
}

/// An event loop running on its own thread. See [`EventLoop::spawn_thread`].
pub struct LoopThread {
    handle: LoopHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Wait for the loop's main future to finish and the thread to exit.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            if let Err(panic) = join.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

/// Drains callbacks marshalled from foreign threads.
///
/// At most `burst` callbacks run per wakeup so a chatty producer cannot
/// starve the coroutines sharing the loop.
async fn dispatch_remote_calls(
    mut remote_rx: mpsc::UnboundedReceiver<ScheduledCall>,
    cancel: CancellationToken,
    burst: usize,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            call = remote_rx.recv() => {
                let Some(call) = call else { break };
                run_scheduled(call);
                let mut executed = 1;
                while executed < burst {
                    match remote_rx.try_recv() {
                        Ok(call) => {
                            run_scheduled(call);
                            executed += 1;
                        }
                        Err(_) => break,
                    }
                }
                tokio::task::yield_now().await;
            }
        }
    }
    trace!("remote callback dispatcher exiting");
}

fn run_scheduled(call: ScheduledCall) {
    if call.delay.is_zero() {
        (call.callback)();
    } else {
        call_later(call.delay, call.callback);
    }
}

/// Publishes the loop in thread-local storage for the duration of `block_on`.
struct EnterLoop {
    previous: Option<LoopHandle>,
}

impl EnterLoop {
    fn new(handle: LoopHandle) -> Self {
        let previous = CURRENT_LOOP.with(|current| current.borrow_mut().replace(handle));
        EnterLoop { previous }
    }
}

impl Drop for EnterLoop {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_LOOP.with(|current| *current.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{current_coroutine, spawn, yield_now};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn callbacks_run_in_schedule_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = log.clone();
        EventLoop::new().unwrap().block_on(async move {
            let first = inner.clone();
            let second = inner.clone();
            call_later(Duration::ZERO, move || first.borrow_mut().push("first"));
            call_later(Duration::ZERO, move || second.borrow_mut().push("second"));
            yield_now().await;
            yield_now().await;
        });
        assert_eq!(*log.borrow(), ["first", "second"]);
    }

    #[test]
    fn cancelled_callback_never_fires() {
        let fired = Rc::new(Cell::new(false));
        let inner = fired.clone();
        EventLoop::new().unwrap().block_on(async move {
            let flag = inner.clone();
            let callback = call_later(Duration::ZERO, move || flag.set(true));
            callback.cancel();
            yield_now().await;
            yield_now().await;
        });
        assert!(!fired.get());
    }

    #[test]
    fn delayed_callback_fires_after_the_delay() {
        let fired = Rc::new(Cell::new(false));
        let inner = fired.clone();
        EventLoop::new().unwrap().block_on(async move {
            let flag = inner.clone();
            call_later(Duration::from_millis(5), move || flag.set(true));
            yield_now().await;
            assert!(!inner.get());
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert!(fired.get());
    }

    #[test]
    fn coroutines_have_identities_and_callbacks_do_not() {
        EventLoop::new().unwrap().block_on(async {
            let main_id = current_coroutine().expect("block_on runs as a coroutine");

            let spawned_id = spawn(async { current_coroutine() }).await.unwrap();
            let spawned_id = spawned_id.expect("spawned tasks run as coroutines");
            assert_ne!(main_id, spawned_id);

            let callback_saw = Rc::new(Cell::new(Some(main_id)));
            let inner = callback_saw.clone();
            call_later(Duration::ZERO, move || inner.set(current_coroutine()));
            yield_now().await;
            assert_eq!(callback_saw.get(), None);
        });
    }

    #[test]
    fn loop_handle_dies_with_the_loop() {
        let eventloop = EventLoop::new().unwrap();
        let handle = eventloop.handle();
        assert!(current_loop().is_none());
        eventloop.block_on(async {
            let inside = current_loop().expect("loop visible from inside");
            assert!(inside.is_alive());
        });
        assert!(current_loop().is_none());
        assert!(!handle.is_alive());
        let refused = handle.call_later_thread_safe(Duration::ZERO, || {});
        assert!(refused.is_err());
    }

    #[test]
    fn thread_safe_callbacks_run_on_the_loop_thread() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let thread = EventLoop::spawn_thread(move || async move {
            let _ = done_rx.await;
        })
        .unwrap();

        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        thread
            .handle()
            .call_later_thread_safe(Duration::ZERO, move || {
                seen_tx.send(thread::current().id()).unwrap();
            })
            .unwrap();
        let loop_thread = seen_rx.recv().unwrap();
        assert_ne!(loop_thread, thread::current().id());

        let handle = thread.handle();
        done_tx.send(()).unwrap();
        thread.join();
        assert!(!handle.is_alive());
    }
}
