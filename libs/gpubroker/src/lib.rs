// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU resource broker.
//!
//! Brings up a GPU backend once, enumerates compute devices, hands out
//! device memory allocations as opaque handles, and moves bytes between host
//! and device against those handles.
//!
//! ```no_run
//! use gpubroker::{BrokerConfig, GpuBroker};
//!
//! let broker: GpuBroker = GpuBroker::new(BrokerConfig::from_env()?);
//! broker.initialize()?;
//! let devices = broker.enumerate_devices()?;
//! let handle = broker.allocate(devices[0].index, 4096)?;
//! broker.copy_to_device(handle, &[1, 2, 3, 4])?;
//! assert_eq!(broker.copy_from_device(handle, 4)?, vec![1, 2, 3, 4]);
//! broker.free(handle)?;
//! broker.shutdown();
//! # Ok::<(), gpubroker::BrokerError>(())
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod driver;
pub mod error;
pub mod host;
pub mod logging;
pub mod memory;
pub mod vulkan;

pub use backend::BackendKind;
pub use config::{BrokerConfig, HostConfig, HostDeviceConfig};
pub use context::GpuBroker;
pub use device::{DeviceDescriptor, DeviceListing, DeviceType, Vendor};
pub use driver::{GpuDriver, SelectedDriver};
pub use error::{BrokerError, Result};
pub use host::HostDriver;
pub use memory::{AllocationHandle, AllocationInfo, AllocationState, MemoryInfo, ShutdownReport};
pub use vulkan::VulkanDriver;
