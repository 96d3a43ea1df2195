// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logging setup.
//!
//! Filters are configured through the `WEFT_LOG` environment variable using
//! the usual `tracing` directive syntax (`info`, `weft_sync=trace`, ...).

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "WEFT_LOG";

/// Default log level.
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the subscriber is only installed once.
static INIT: Once = Once::new();

/// Install the global `tracing` subscriber. Safe to call repeatedly; only the
/// first call has an effect.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}
