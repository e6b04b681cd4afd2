// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Context, Result};
use gpubroker::GpuBroker;

use super::mib;

pub fn run(broker: &GpuBroker, device: usize) -> Result<()> {
    let name = broker.device_name(device)?;
    let info = broker
        .memory_info(device)
        .with_context(|| format!("Failed to query memory of device {device}"))?;

    println!("[{device}] {name}");
    println!("  Total:       {}", mib(info.total_bytes));
    println!("  Used:        {}", mib(info.used_bytes));
    println!("  Available:   {}", mib(info.available_bytes));
    println!("  Allocations: {}", info.live_allocations);
    Ok(())
}
