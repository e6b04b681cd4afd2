// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process-wide `tracing` subscriber.
//!
//! Hosts that load the broker as a shared library usually have no Rust
//! subscriber installed, so broker diagnostics would be dropped. `init`
//! installs a stderr fmt subscriber once; if the host already installed one,
//! that subscriber is kept.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Environment variable checked before `RUST_LOG`.
pub const ENV_VAR: &str = "GPUBROKER_LOG";

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Install the stderr subscriber. Returns whether this call (or an earlier
/// one) installed it; `false` means another subscriber owns the process.
pub fn init(default_filter: &str) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(ENV_VAR)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| {
                EnvFilter::try_new(default_filter).unwrap_or_else(|_| EnvFilter::new("info"))
            });

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init()
            .is_ok()
    })
}
