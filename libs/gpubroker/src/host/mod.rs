// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host-memory driver.
//!
//! Simulates the configured device list with ordinary heap buffers. Used as
//! the fallback when no Vulkan driver is present and as the deterministic
//! backend for tests.

use parking_lot::Mutex;

use crate::backend::BackendKind;
use crate::config::{BrokerConfig, HostDeviceConfig};
use crate::device::{DeviceDescriptor, DeviceType, Vendor};
use crate::driver::{GpuDriver, host_buffer};
use crate::error::{BrokerError, Result};

pub struct HostDriver {
    devices: Vec<HostDeviceConfig>,
}

pub struct HostAllocation {
    bytes: Mutex<Vec<u8>>,
}

fn checked_range(offset: u64, len: u64, capacity: usize) -> Result<std::ops::Range<usize>> {
    let end = offset.checked_add(len).filter(|&end| end <= capacity as u64);
    match end {
        Some(end) => Ok(offset as usize..end as usize),
        None => Err(BrokerError::SizeMismatch {
            requested: offset.saturating_add(len),
            capacity: capacity as u64,
        }),
    }
}

impl HostDriver {
    pub fn new(devices: Vec<HostDeviceConfig>) -> Self {
        Self { devices }
    }
}

impl GpuDriver for HostDriver {
    type Allocation = HostAllocation;

    fn open(config: &BrokerConfig) -> Result<Self> {
        if config.host.devices.is_empty() {
            return Err(BrokerError::driver("Host backend has no configured devices"));
        }
        tracing::info!(
            "Host backend initialized with {} device(s)",
            config.host.devices.len()
        );
        Ok(Self::new(config.host.devices.clone()))
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Host
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| DeviceDescriptor {
                index,
                name: device.name.clone(),
                vendor: Vendor::Unknown,
                device_type: DeviceType::Cpu,
                memory_bytes: device.memory_bytes,
                compute_units: device.compute_units,
                driver_version: env!("CARGO_PKG_VERSION").to_string(),
                api_version: "host".to_string(),
            })
            .collect())
    }

    fn allocate(&self, device_index: usize, size_bytes: u64) -> Result<HostAllocation> {
        if device_index >= self.devices.len() {
            return Err(BrokerError::InvalidDeviceIndex {
                index: device_index,
                count: self.devices.len(),
            });
        }
        Ok(HostAllocation {
            bytes: Mutex::new(host_buffer(size_bytes)?),
        })
    }

    fn free(&self, allocation: HostAllocation) {
        drop(allocation);
    }

    fn write(&self, allocation: &HostAllocation, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = allocation.bytes.lock();
        let range = checked_range(offset, data.len() as u64, bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, allocation: &HostAllocation, offset: u64, out: &mut [u8]) -> Result<()> {
        let bytes = allocation.bytes.lock();
        let range = checked_range(offset, out.len() as u64, bytes.len())?;
        out.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn copy(&self, src: &HostAllocation, dst: &HostAllocation, len: u64) -> Result<()> {
        if std::ptr::eq(src, dst) {
            return Ok(());
        }
        let mut staged = host_buffer(len)?;
        self.read(src, 0, &mut staged)?;
        self.write(dst, 0, &staged)
    }

    fn synchronize(&self, device_index: usize) -> Result<()> {
        if device_index >= self.devices.len() {
            return Err(BrokerError::InvalidDeviceIndex {
                index: device_index,
                count: self.devices.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> HostDriver {
        HostDriver::new(vec![
            HostDeviceConfig {
                name: "sim-0".into(),
                memory_bytes: 1024,
                compute_units: 4,
            },
            HostDeviceConfig {
                name: "sim-1".into(),
                memory_bytes: 2048,
                compute_units: 2,
            },
        ])
    }

    #[test]
    fn test_enumerate_reports_configured_devices() {
        let devices = driver().enumerate().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].index, 1);
        assert_eq!(devices[1].name, "sim-1");
        assert_eq!(devices[1].memory_bytes, 2048);
        assert_eq!(devices[0].device_type, DeviceType::Cpu);
    }

    #[test]
    fn test_write_read_at_offset() {
        let driver = driver();
        let alloc = driver.allocate(0, 16).unwrap();

        driver.write(&alloc, 4, &[1, 2, 3]).unwrap();
        let mut out = [0xFFu8; 5];
        driver.read(&alloc, 3, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3, 0]);
        driver.free(alloc);
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let driver = driver();
        let alloc = driver.allocate(0, 8).unwrap();

        assert!(matches!(
            driver.write(&alloc, 6, &[0; 4]),
            Err(BrokerError::SizeMismatch {
                requested: 10,
                capacity: 8
            })
        ));
        assert!(driver.read(&alloc, u64::MAX, &mut [0; 2]).is_err());
    }

    #[test]
    fn test_copy_between_allocations() {
        let driver = driver();
        let src = driver.allocate(0, 8).unwrap();
        let dst = driver.allocate(1, 8).unwrap();

        driver.write(&src, 0, b"abcdefgh").unwrap();
        driver.copy(&src, &dst, 4).unwrap();
        let mut out = [0xFFu8; 8];
        driver.read(&dst, 0, &mut out).unwrap();
        assert_eq!(&out, b"abcd\0\0\0\0");

        // Self-copy is a no-op and must not deadlock.
        driver.copy(&src, &src, 8).unwrap();
    }

    #[test]
    fn test_invalid_device() {
        let driver = driver();
        assert!(matches!(
            driver.allocate(5, 8),
            Err(BrokerError::InvalidDeviceIndex { index: 5, count: 2 })
        ));
        assert!(driver.synchronize(2).is_err());
    }
}
