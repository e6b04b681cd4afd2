// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Context, Result, bail};
use gpubroker::GpuBroker;

use super::mib;

/// One allocate/write/read/verify/free cycle.
pub fn run(broker: &GpuBroker, device: usize, size: u64) -> Result<()> {
    let len = usize::try_from(size).context("Size does not fit in host memory")?;
    let pattern: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

    let handle = broker
        .allocate(device, size)
        .with_context(|| format!("Failed to allocate {} on device {}", mib(size), device))?;
    println!("allocated {handle} ({})", mib(size));

    broker.copy_to_device(handle, &pattern).context("Upload failed")?;
    let readback = broker.copy_from_device(handle, size).context("Readback failed")?;

    if let Some(offset) = pattern.iter().zip(&readback).position(|(a, b)| a != b) {
        broker.free(handle)?;
        bail!(
            "Readback mismatch at byte {offset}: wrote {:#04x}, read {:#04x}",
            pattern[offset],
            readback[offset]
        );
    }
    println!("verified {} bytes", readback.len());

    broker.free(handle).context("Free failed")?;
    println!("freed {handle}");
    println!("OK");
    Ok(())
}
