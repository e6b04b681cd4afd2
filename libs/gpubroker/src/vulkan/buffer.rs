// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vulkan buffer bound to dedicated device memory.

use std::ptr::NonNull;

use ash::vk;

use crate::error::{BrokerError, Result};

use super::{vk_alloc_error, vk_error};

/// Usage for broker allocations: transfer endpoints and shader storage.
pub const ALLOCATION_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
);

const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
        | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// A `VkBuffer` with its own `VkDeviceMemory`.
///
/// Host-visible, host-coherent memory is mapped for the buffer's lifetime so
/// transfers can bypass staging.
pub(crate) struct VulkanBuffer {
    device: ash::Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    mapped: Option<NonNull<u8>>,
}

impl VulkanBuffer {
    /// Create a buffer, preferring `preferred` memory and requiring `required`.
    pub fn new(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: u64,
        usage: vk::BufferUsageFlags,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| vk_alloc_error("create buffer", e))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let Some((memory_type_index, flags)) = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            required,
            preferred,
        ) else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(BrokerError::AllocationFailed(format!(
                "No memory type with {required:?} for a {size}-byte buffer"
            )));
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(vk_alloc_error("allocate device memory", e));
            }
        };

        let release = |err: BrokerError| {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            err
        };

        unsafe { device.bind_buffer_memory(buffer, memory, 0) }
            .map_err(|e| release(vk_alloc_error("bind buffer memory", e)))?;

        let mapped = if flags.contains(HOST_COHERENT) {
            let ptr = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            }
            .map_err(|e| release(vk_error("map memory", e)))?;
            NonNull::new(ptr.cast::<u8>())
        } else {
            None
        };

        Ok(Self {
            device: device.clone(),
            buffer,
            memory,
            size,
            mapped,
        })
    }

    /// Host-visible, host-coherent buffer used to stage transfers.
    pub fn staging(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: u64,
    ) -> Result<Self> {
        let staging = Self::new(
            device,
            memory_properties,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_CACHED,
        )?;
        if staging.mapped.is_none() {
            return Err(BrokerError::driver("Staging buffer memory could not be mapped"));
        }
        Ok(staging)
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copy `data` into mapped memory at `offset`.
    pub fn write_mapped(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.mapped_range(offset, data.len() as u64)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Ok(())
    }

    /// Fill `out` from mapped memory at `offset`.
    pub fn read_mapped(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let ptr = self.mapped_range(offset, out.len() as u64)?;
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn mapped_range(&self, offset: u64, len: u64) -> Result<*mut u8> {
        let base = self
            .mapped
            .ok_or_else(|| BrokerError::driver("Buffer memory is not host-mapped"))?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(unsafe { base.as_ptr().add(offset as usize) }),
            _ => Err(BrokerError::SizeMismatch {
                requested: offset.saturating_add(len),
                capacity: self.size,
            }),
        }
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.is_some() {
                self.device.unmap_memory(self.memory);
            }
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

// VulkanBuffer is Send + Sync because Vulkan handles are thread-safe
unsafe impl Send for VulkanBuffer {}
unsafe impl Sync for VulkanBuffer {}

/// Index and flags of the first memory type allowed by `type_bits` that has
/// `required | preferred`, else the first that has `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<(u32, vk::MemoryPropertyFlags)> {
    let types = &memory_properties.memory_types[..memory_properties.memory_type_count as usize];
    let candidates = || {
        types
            .iter()
            .enumerate()
            .filter(move |(i, _)| type_bits & (1 << i) != 0)
            .map(|(i, t)| (i as u32, t.property_flags))
    };

    candidates()
        .find(|(_, flags)| flags.contains(required | preferred))
        .or_else(|| candidates().find(|(_, flags)| flags.contains(required)))
}
