// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Throttled worker pool: a semaphore caps concurrency, a gate pauses the
//! pool, and a cross-thread event stops the loop from a foreign thread.

use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weft_eventloop::{logging, spawn, yield_now, EventLoop};
use weft_sync::{Gate, Semaphore, ThreadEvent};

fn main() -> anyhow::Result<()> {
    logging::init();

    let stop = Arc::new(ThreadEvent::new());
    let stopper = stop.clone();
    let timer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        stopper.set();
    });

    EventLoop::new()?.block_on(async move {
        let permits = Rc::new(Semaphore::new(4));
        let gate = Rc::new(Gate::new());

        let mut workers = Vec::new();
        for id in 0..16u32 {
            let permits = permits.clone();
            let gate = gate.clone();
            workers.push(spawn(async move {
                gate.go_through().await;
                if let Some(_permit) = permits.acquire_scoped().await {
                    tracing::info!(worker = id, "working");
                    yield_now().await;
                }
            }));
        }

        // Hold the pool at the gate for one pass, then let it run.
        gate.close();
        yield_now().await;
        tracing::info!(parked = gate.waiting(), "pool paused");
        gate.open();

        for worker in workers {
            let _ = worker.await;
        }

        stop.wait().await;
        tracing::info!("stop signal received, shutting down");
    });

    timer.join().expect("timer thread");
    Ok(())
}
