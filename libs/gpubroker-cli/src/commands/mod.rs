// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

pub mod bench;
pub mod devices;
pub mod memory;
pub mod smoke;

use std::path::Path;

use anyhow::{Context, Result};
use gpubroker::{BackendKind, BrokerConfig, GpuBroker};

/// Load configuration, install logging, and bring the backend up.
pub fn open_broker(config_path: Option<&Path>, backend: Option<BackendKind>) -> Result<GpuBroker> {
    let mut config = match config_path {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None if std::env::var_os(BrokerConfig::ENV_VAR).is_some() => {
            BrokerConfig::from_env().context("Failed to load $GPUBROKER_CONFIG")?
        }
        None => BrokerConfig::load_or_default(&std::env::current_dir()?),
    };
    if backend.is_some() {
        config.backend = backend;
    }

    gpubroker::logging::init(&config.log_filter);

    let broker = GpuBroker::new(config);
    broker
        .initialize()
        .with_context(|| format!("Failed to initialize {} backend", broker.config().resolved_backend()))?;
    Ok(broker)
}

/// Parse a byte count with an optional binary `K`/`M`/`G` suffix.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 10),
        Some((i, 'm' | 'M')) => (&s[..i], 20),
        Some((i, 'g' | 'G')) => (&s[..i], 30),
        _ => (s, 0),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

/// Bytes as MiB with one decimal.
pub fn mib(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("2m"), Ok(2 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Ok(1 << 30));
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("99999999999G").is_err());
    }

    #[test]
    fn test_mib_formatting() {
        assert_eq!(mib(1024 * 1024), "1.0 MiB");
        assert_eq!(mib(3 * 512 * 1024), "1.5 MiB");
    }
}
