// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use anyhow::{Context, Result};
use gpubroker::{DeviceListing, GpuBroker};

use super::mib;

/// List devices of the current enumeration session.
pub fn run(broker: &GpuBroker, json: bool) -> Result<()> {
    let devices = broker.enumerate_devices().context("Failed to enumerate devices")?;

    if json {
        println!("{}", DeviceListing::new(&devices).to_json()?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!(
        "{} device(s) via {} (session {}):\n",
        devices.len(),
        broker.backend()?,
        broker.session_id()?
    );

    for device in &devices {
        println!("  [{}] {}", device.index, device.name);
        println!("    Type:          {}", device.device_type);
        println!("    Vendor:        {}", device.vendor);
        println!("    Memory:        {}", mib(device.memory_bytes));
        println!("    Compute units: {}", device.compute_units);
        println!("    Driver:        {}", device.driver_version);
        println!("    API:           {}", device.api_version);
        println!();
    }

    Ok(())
}
