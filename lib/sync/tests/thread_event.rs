// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-thread scenarios for [`ThreadEvent`].

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::{run, until};
use weft_eventloop::{spawn, EventLoop};
use weft_sync::ThreadEvent;

/// Spin until `condition` holds, from a thread that runs no loop.
fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("condition was never reached");
}

#[test]
fn a_foreign_thread_wakes_a_loop_coroutine() {
    let event = Arc::new(ThreadEvent::new());
    let (result_tx, result_rx) = mpsc::channel();

    let loop_event = event.clone();
    let loop_thread = EventLoop::spawn_thread(move || async move {
        let result = loop_event.wait().await;
        result_tx.send(result).unwrap();
    })
    .unwrap();

    wait_for(|| event.waiting() == 1);
    event.set();

    assert!(result_rx.recv().unwrap());
    loop_thread.join();
}

#[test]
fn dropping_the_last_handle_releases_a_parked_waiter() {
    let event = Arc::new(ThreadEvent::new());
    let (result_tx, result_rx) = mpsc::channel();

    let loop_event = event.clone();
    let loop_thread = EventLoop::spawn_thread(move || async move {
        // The future holds the event's core on its own; the loop keeps no
        // handle alive.
        let wait = loop_event.wait();
        drop(loop_event);
        let result = wait.await;
        result_tx.send(result).unwrap();
    })
    .unwrap();

    wait_for(|| event.waiting() == 1);
    // Last handle anywhere: the waiter must unblock with false, because the
    // flag was never set.
    drop(event);

    assert!(!result_rx.recv().unwrap());
    loop_thread.join();
}

#[test]
fn plain_threads_block_on_the_condvar() {
    let event = Arc::new(ThreadEvent::new());
    let waiter = {
        let event = event.clone();
        thread::spawn(move || event.wait_blocking())
    };

    wait_for(|| event.waiting() == 1);
    event.set();
    assert!(waiter.join().unwrap());
}

#[test]
fn set_fans_out_to_many_loops_and_threads() {
    let event = Arc::new(ThreadEvent::new());

    let mut results = Vec::new();
    let mut loops = Vec::new();
    for _ in 0..2 {
        let event = event.clone();
        let (result_tx, result_rx) = mpsc::channel();
        loops.push(
            EventLoop::spawn_thread(move || async move {
                let result = event.wait().await;
                result_tx.send(result).unwrap();
            })
            .unwrap(),
        );
        results.push(result_rx);
    }
    let blocking = {
        let event = event.clone();
        thread::spawn(move || event.wait_blocking())
    };

    wait_for(|| event.waiting() == 3);
    event.set();

    for result in results {
        assert!(result.recv().unwrap());
    }
    assert!(blocking.join().unwrap());
    for loop_thread in loops {
        loop_thread.join();
    }
}

#[test]
fn set_on_the_waiters_own_loop_notifies_directly() {
    run(async {
        let event = Rc::new(ThreadEvent::new());
        let woken = Rc::new(Cell::new(false));
        {
            let event = event.clone();
            let woken = woken.clone();
            spawn(async move {
                assert!(event.wait().await);
                woken.set(true);
            });
        }
        {
            let event = event.clone();
            until(move || event.waiting() == 1).await;
        }

        event.set();
        {
            let woken = woken.clone();
            until(move || woken.get()).await;
        }
        assert_eq!(event.waiting(), 0);
    });
}

#[test]
fn the_rising_edge_fires_once_per_clear_cycle() {
    let event = ThreadEvent::new();
    event.set();
    event.set();
    assert!(event.wait_blocking());

    event.clear();
    assert!(!event.is_set());
    event.set();
    assert!(event.is_set());
}
