// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use gpubroker::GpuBroker;

use super::mib;

pub fn run(broker: &GpuBroker, device: usize, size: u64, iterations: u32) -> Result<()> {
    if iterations == 0 {
        bail!("--iterations must be at least 1");
    }
    let len = usize::try_from(size).context("Size does not fit in host memory")?;
    let data = vec![0x5Au8; len];

    let handle = broker
        .allocate(device, size)
        .with_context(|| format!("Failed to allocate {} on device {}", mib(size), device))?;

    let mut upload = Duration::ZERO;
    let mut download = Duration::ZERO;
    for _ in 0..iterations {
        let start = Instant::now();
        broker.copy_to_device(handle, &data)?;
        broker.synchronize(device)?;
        upload += start.elapsed();

        let start = Instant::now();
        let out = broker.copy_from_device(handle, size)?;
        download += start.elapsed();
        std::hint::black_box(out);
    }
    broker.free(handle)?;

    let total = size as f64 * f64::from(iterations) / (1024.0 * 1024.0);
    println!(
        "{} x {} on device {} ({})",
        iterations,
        mib(size),
        device,
        broker.device_name(device)?
    );
    println!("  host -> device: {:>10.1} MiB/s", total / upload.as_secs_f64().max(f64::EPSILON));
    println!("  device -> host: {:>10.1} MiB/s", total / download.as_secs_f64().max(f64::EPSILON));
    Ok(())
}
