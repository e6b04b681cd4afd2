// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Driver seam between the broker and a concrete GPU backend.
//!
//! The broker owns validation, accounting, handle bookkeeping and locking.
//! A driver only moves bytes and owns native resources. Device indices passed
//! to a driver always refer to the order of its most recent `enumerate`.

use crate::backend::BackendKind;
use crate::config::BrokerConfig;
use crate::device::DeviceDescriptor;
use crate::error::{BrokerError, Result};
use crate::host::{HostAllocation, HostDriver};
use crate::vulkan::{VulkanAllocation, VulkanDriver};

pub trait GpuDriver: Send + Sync + Sized {
    /// Native resources backing one allocation.
    type Allocation: Send + Sync;

    /// Bring the driver up from configuration.
    fn open(config: &BrokerConfig) -> Result<Self>;

    fn backend(&self) -> BackendKind;

    /// Query every usable device, in driver order. `index` fields are filled.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    fn allocate(&self, device_index: usize, size_bytes: u64) -> Result<Self::Allocation>;

    /// Release native resources. Must not fail; problems are logged.
    fn free(&self, allocation: Self::Allocation);

    /// Write `data` at `offset`. The caller has bounds-checked the range.
    fn write(&self, allocation: &Self::Allocation, offset: u64, data: &[u8]) -> Result<()>;

    /// Fill `out` from `offset`. The caller has bounds-checked the range.
    fn read(&self, allocation: &Self::Allocation, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Copy `len` bytes from the start of `src` to the start of `dst`.
    fn copy(&self, src: &Self::Allocation, dst: &Self::Allocation, len: u64) -> Result<()>;

    /// Block until all submitted work on the device has finished.
    fn synchronize(&self, device_index: usize) -> Result<()>;
}

/// Driver chosen at runtime from configuration.
pub enum SelectedDriver {
    Vulkan(VulkanDriver),
    Host(HostDriver),
}

pub enum SelectedAllocation {
    Vulkan(VulkanAllocation),
    Host(HostAllocation),
}

/// Zeroed host buffer of `len` bytes. Running out of host memory is reported
/// as `AllocationFailed` instead of aborting the process.
pub(crate) fn host_buffer(len: u64) -> Result<Vec<u8>> {
    let failed = || BrokerError::AllocationFailed(format!("{len} bytes of host memory"));
    let len = usize::try_from(len).map_err(|_| failed())?;

    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).map_err(|_| failed())?;
    bytes.resize(len, 0);
    Ok(bytes)
}

fn mismatched_allocation() -> BrokerError {
    BrokerError::driver("Allocation belongs to a different driver backend")
}

impl GpuDriver for SelectedDriver {
    type Allocation = SelectedAllocation;

    fn open(config: &BrokerConfig) -> Result<Self> {
        match config.resolved_backend() {
            BackendKind::Host => Ok(Self::Host(HostDriver::open(config)?)),
            BackendKind::Vulkan => match VulkanDriver::open(config) {
                Ok(driver) => Ok(Self::Vulkan(driver)),
                Err(e) if config.fallback_to_host => {
                    tracing::warn!("Vulkan unavailable ({}), falling back to host backend", e);
                    Ok(Self::Host(HostDriver::open(config)?))
                }
                Err(e) => Err(e),
            },
        }
    }

    fn backend(&self) -> BackendKind {
        match self {
            Self::Vulkan(d) => d.backend(),
            Self::Host(d) => d.backend(),
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        match self {
            Self::Vulkan(d) => d.enumerate(),
            Self::Host(d) => d.enumerate(),
        }
    }

    fn allocate(&self, device_index: usize, size_bytes: u64) -> Result<Self::Allocation> {
        match self {
            Self::Vulkan(d) => d
                .allocate(device_index, size_bytes)
                .map(SelectedAllocation::Vulkan),
            Self::Host(d) => d
                .allocate(device_index, size_bytes)
                .map(SelectedAllocation::Host),
        }
    }

    fn free(&self, allocation: Self::Allocation) {
        match (self, allocation) {
            (Self::Vulkan(d), SelectedAllocation::Vulkan(a)) => d.free(a),
            (Self::Host(d), SelectedAllocation::Host(a)) => d.free(a),
            _ => tracing::error!("{}", mismatched_allocation()),
        }
    }

    fn write(&self, allocation: &Self::Allocation, offset: u64, data: &[u8]) -> Result<()> {
        match (self, allocation) {
            (Self::Vulkan(d), SelectedAllocation::Vulkan(a)) => d.write(a, offset, data),
            (Self::Host(d), SelectedAllocation::Host(a)) => d.write(a, offset, data),
            _ => Err(mismatched_allocation()),
        }
    }

    fn read(&self, allocation: &Self::Allocation, offset: u64, out: &mut [u8]) -> Result<()> {
        match (self, allocation) {
            (Self::Vulkan(d), SelectedAllocation::Vulkan(a)) => d.read(a, offset, out),
            (Self::Host(d), SelectedAllocation::Host(a)) => d.read(a, offset, out),
            _ => Err(mismatched_allocation()),
        }
    }

    fn copy(&self, src: &Self::Allocation, dst: &Self::Allocation, len: u64) -> Result<()> {
        match (self, src, dst) {
            (Self::Vulkan(d), SelectedAllocation::Vulkan(s), SelectedAllocation::Vulkan(t)) => {
                d.copy(s, t, len)
            }
            (Self::Host(d), SelectedAllocation::Host(s), SelectedAllocation::Host(t)) => {
                d.copy(s, t, len)
            }
            _ => Err(mismatched_allocation()),
        }
    }

    fn synchronize(&self, device_index: usize) -> Result<()> {
        match self {
            Self::Vulkan(d) => d.synchronize(device_index),
            Self::Host(d) => d.synchronize(device_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_buffer_reports_exhaustion() {
        assert_eq!(host_buffer(16).unwrap(), vec![0u8; 16]);
        assert!(host_buffer(0).unwrap().is_empty());
        assert!(matches!(
            host_buffer(u64::MAX),
            Err(BrokerError::AllocationFailed(_))
        ));
    }

    #[test]
    fn test_explicit_host_backend_opens() {
        let config = BrokerConfig {
            backend: Some(BackendKind::Host),
            ..BrokerConfig::default()
        };
        let driver = SelectedDriver::open(&config).unwrap();
        assert_eq!(driver.backend(), BackendKind::Host);
        assert_eq!(driver.enumerate().unwrap().len(), 1);
    }

    #[test]
    fn test_fallback_always_yields_a_driver() {
        let config = BrokerConfig {
            backend: Some(BackendKind::Vulkan),
            fallback_to_host: true,
            ..BrokerConfig::default()
        };
        // Vulkan when a loader and device exist, host otherwise.
        let driver = SelectedDriver::open(&config).unwrap();
        assert!(!driver.enumerate().unwrap().is_empty());
    }
}
