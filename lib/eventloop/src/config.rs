// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Event loop settings.
//!
//! Settings come from defaults merged with `WEFT_`-prefixed environment
//! variables, e.g. `WEFT_THREAD_NAME=io-loop`.

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// ENV prefix for all loop settings.
const ENV_PREFIX: &str = "WEFT_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// OS thread name used by [`EventLoop::spawn_thread`](crate::EventLoop::spawn_thread).
    pub thread_name: String,

    /// Maximum number of marshalled callbacks executed per dispatcher wakeup
    /// before yielding back to the loop's coroutines.
    pub max_callback_burst: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            thread_name: "weft-loop".to_string(),
            max_callback_burst: 64,
        }
    }
}

impl LoopConfig {
    /// Load settings from the environment over the built-in defaults.
    pub fn from_settings() -> anyhow::Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(LoopConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = LoopConfig::default();
        assert_eq!(config.thread_name, "weft-loop");
        assert!(config.max_callback_burst > 0);
    }

    #[test]
    fn from_settings_falls_back_to_defaults() {
        let config = LoopConfig::from_settings().unwrap();
        assert!(config.max_callback_burst > 0);
    }
}
