// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! [`GpuDriver`] over Vulkan.

use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, RwLock};

use crate::backend::BackendKind;
use crate::config::BrokerConfig;
use crate::device::{DeviceDescriptor, DeviceType};
use crate::driver::{GpuDriver, host_buffer};
use crate::error::{BrokerError, Result};

use super::buffer::{ALLOCATION_USAGE, VulkanBuffer};
use super::commands::{transfer_barrier, transfer_to_host_barrier};
use super::device::VulkanDevice;
use super::instance::{PhysicalDeviceInfo, VulkanInstance};

/// Vulkan backend: one instance, lazily opened logical devices.
pub struct VulkanDriver {
    physical: RwLock<Vec<PhysicalDeviceInfo>>,
    devices: Mutex<Vec<Option<Arc<VulkanDevice>>>>,
    default_device: usize,
    staging_chunk_bytes: u64,
    default_compute_units: u32,
    instance: Arc<VulkanInstance>,
}

/// Device memory owned by one broker allocation.
pub struct VulkanAllocation {
    // Dropped before `device`, so the buffer never outlives its device.
    buffer: VulkanBuffer,
    device: Arc<VulkanDevice>,
}

impl VulkanAllocation {
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }
}

impl VulkanDriver {
    /// Index of the device opened at startup.
    pub fn default_device(&self) -> usize {
        self.default_device
    }

    /// Logical device for `index`, opening it on first use.
    fn logical_device(&self, index: usize) -> Result<Arc<VulkanDevice>> {
        let mut devices = self.devices.lock();
        let count = devices.len();
        let slot = devices
            .get_mut(index)
            .ok_or(BrokerError::InvalidDeviceIndex { index, count })?;

        if let Some(device) = slot.as_ref() {
            return Ok(device.clone());
        }

        let info = self.physical.read()[index].clone();
        let device = Arc::new(VulkanDevice::new(self.instance.clone(), &info)?);
        *slot = Some(device.clone());
        Ok(device)
    }

    fn opened_device(&self, index: usize) -> Result<Option<Arc<VulkanDevice>>> {
        let devices = self.devices.lock();
        devices
            .get(index)
            .cloned()
            .ok_or(BrokerError::InvalidDeviceIndex {
                index,
                count: devices.len(),
            })
    }

    fn staging_for(&self, device: &VulkanDevice, len: u64) -> Result<(VulkanBuffer, u64)> {
        let chunk = self.staging_chunk_bytes.min(len);
        let staging = VulkanBuffer::staging(device.handle(), device.memory_properties(), chunk)?;
        Ok((staging, chunk))
    }
}

impl GpuDriver for VulkanDriver {
    type Allocation = VulkanAllocation;

    fn open(config: &BrokerConfig) -> Result<Self> {
        let instance = Arc::new(VulkanInstance::new(config)?);
        let physical = instance.physical_devices(config.default_compute_units)?;

        if physical.is_empty() {
            return Err(BrokerError::driver("No compute-capable Vulkan devices found"));
        }

        // Prefer discrete GPU, fall back to first available
        let default_device = physical
            .iter()
            .position(|info| {
                config.prefer_discrete && info.descriptor.device_type == DeviceType::Discrete
            })
            .unwrap_or(0);

        let selected = &physical[default_device];
        tracing::info!(
            "Selected Vulkan device: {} (type: {})",
            selected.descriptor.name,
            selected.descriptor.device_type
        );

        let mut devices: Vec<Option<Arc<VulkanDevice>>> = vec![None; physical.len()];
        devices[default_device] = Some(Arc::new(VulkanDevice::new(instance.clone(), selected)?));

        Ok(Self {
            physical: RwLock::new(physical),
            devices: Mutex::new(devices),
            default_device,
            staging_chunk_bytes: config.staging_chunk_bytes,
            default_compute_units: config.default_compute_units,
            instance,
        })
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    /// Re-reads properties of every listed device. The physical device set
    /// of an instance is fixed, so indices keep naming the same hardware.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut physical = self.physical.write();
        for info in physical.iter_mut() {
            *info = self.instance.refresh(info, self.default_compute_units);
        }
        Ok(physical.iter().map(|info| info.descriptor.clone()).collect())
    }

    fn allocate(&self, device_index: usize, size_bytes: u64) -> Result<VulkanAllocation> {
        let device = self.logical_device(device_index)?;
        let buffer = VulkanBuffer::new(
            device.handle(),
            device.memory_properties(),
            size_bytes,
            ALLOCATION_USAGE,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        tracing::debug!(
            "{}: allocated {} bytes (host-mapped: {})",
            device.name(),
            size_bytes,
            buffer.is_mapped()
        );

        Ok(VulkanAllocation { buffer, device })
    }

    fn free(&self, allocation: VulkanAllocation) {
        tracing::debug!(
            "{}: freeing {} bytes",
            allocation.device.name(),
            allocation.size()
        );
        drop(allocation);
    }

    fn write(&self, allocation: &VulkanAllocation, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if allocation.buffer.is_mapped() {
            return allocation.buffer.write_mapped(offset, data);
        }

        let device = &allocation.device;
        let (staging, chunk) = self.staging_for(device, data.len() as u64)?;

        let piece_len = usize::try_from(chunk).unwrap_or(usize::MAX);
        for (i, piece) in data.chunks(piece_len).enumerate() {
            staging.write_mapped(0, piece)?;
            let region = vk::BufferCopy::default()
                .src_offset(0)
                .dst_offset(offset + i as u64 * chunk)
                .size(piece.len() as u64);

            device.submit_and_wait(|vk_device, cmd| unsafe {
                vk_device.cmd_copy_buffer(cmd, staging.buffer(), allocation.buffer.buffer(), &[region]);
            })?;
        }
        Ok(())
    }

    fn read(&self, allocation: &VulkanAllocation, offset: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        if allocation.buffer.is_mapped() {
            return allocation.buffer.read_mapped(offset, out);
        }

        let device = &allocation.device;
        let (staging, chunk) = self.staging_for(device, out.len() as u64)?;

        let piece_len = usize::try_from(chunk).unwrap_or(usize::MAX);
        for (i, piece) in out.chunks_mut(piece_len).enumerate() {
            let region = vk::BufferCopy::default()
                .src_offset(offset + i as u64 * chunk)
                .dst_offset(0)
                .size(piece.len() as u64);

            device.submit_and_wait(|vk_device, cmd| {
                unsafe {
                    vk_device.cmd_copy_buffer(
                        cmd,
                        allocation.buffer.buffer(),
                        staging.buffer(),
                        &[region],
                    );
                }
                transfer_to_host_barrier(vk_device, cmd);
            })?;
            staging.read_mapped(0, piece)?;
        }
        Ok(())
    }

    fn copy(&self, src: &VulkanAllocation, dst: &VulkanAllocation, len: u64) -> Result<()> {
        if len == 0 || src.buffer.buffer() == dst.buffer.buffer() {
            return Ok(());
        }

        if !Arc::ptr_eq(&src.device, &dst.device) {
            // Different logical devices share no queue; go through the host.
            let mut bytes = host_buffer(len)?;
            self.read(src, 0, &mut bytes)?;
            return self.write(dst, 0, &bytes);
        }

        let region = vk::BufferCopy::default().src_offset(0).dst_offset(0).size(len);
        src.device.submit_and_wait(|vk_device, cmd| {
            transfer_barrier(vk_device, cmd);
            unsafe {
                vk_device.cmd_copy_buffer(cmd, src.buffer.buffer(), dst.buffer.buffer(), &[region]);
            }
        })
    }

    fn synchronize(&self, device_index: usize) -> Result<()> {
        match self.opened_device(device_index)? {
            Some(device) => device.wait_idle(),
            // Never opened, so nothing was submitted.
            None => Ok(()),
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        self.devices.get_mut().clear();
        tracing::info!("Vulkan driver shut down");
    }
}
