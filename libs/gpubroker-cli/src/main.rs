// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! gpubroker CLI
//!
//! Operator tool for inspecting devices and exercising the broker.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gpubroker::BackendKind;

mod commands;

#[derive(Parser)]
#[command(name = "gpubroker")]
#[command(author, version, about = "GPU resource broker CLI", long_about = None)]
struct Cli {
    /// Configuration file (default: ./gpubroker.toml or $GPUBROKER_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Driver backend (vulkan or host)
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices visible to the backend
    Devices {
        /// Print the JSON document handed across the C ABI
        #[arg(long)]
        json: bool,
    },

    /// Show memory usage of a device
    Memory {
        /// Device index
        #[arg(short, long, default_value = "0")]
        device: usize,
    },

    /// Allocate, write a pattern, read it back, verify, and free
    Smoke {
        /// Device index
        #[arg(short, long, default_value = "0")]
        device: usize,

        /// Allocation size (accepts K, M, G suffixes)
        #[arg(short, long, default_value = "1M", value_parser = commands::parse_size)]
        size: u64,
    },

    /// Measure transfer throughput in both directions
    Bench {
        /// Device index
        #[arg(short, long, default_value = "0")]
        device: usize,

        /// Transfer size (accepts K, M, G suffixes)
        #[arg(short, long, default_value = "64M", value_parser = commands::parse_size)]
        size: u64,

        /// Number of round trips
        #[arg(short = 'n', long, default_value = "10")]
        iterations: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        // No subcommand: show help
        Cli::parse_from(["gpubroker", "--help"]);
        return Ok(());
    };

    let broker = commands::open_broker(cli.config.as_deref(), cli.backend)?;

    let result = match command {
        Commands::Devices { json } => commands::devices::run(&broker, json),
        Commands::Memory { device } => commands::memory::run(&broker, device),
        Commands::Smoke { device, size } => commands::smoke::run(&broker, device, size),
        Commands::Bench {
            device,
            size,
            iterations,
        } => commands::bench::run(&broker, device, size, iterations),
    };

    let report = broker.shutdown();
    if report.allocations_released > 0 {
        tracing::warn!(
            "Reclaimed {} allocation(s) ({} bytes) at exit",
            report.allocations_released,
            report.bytes_released
        );
    }
    result
}
