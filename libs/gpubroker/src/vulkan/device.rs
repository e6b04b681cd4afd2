// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Logical device with one compute queue.

use std::ffi::c_char;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::error::Result;

use super::commands::{self, SubmitContext};
use super::instance::{PhysicalDeviceInfo, VulkanInstance};
use super::vk_error;

/// Logical device opened on one physical device.
///
/// Queue submission and the command pool require external synchronization,
/// so both live behind `submit`.
pub(crate) struct VulkanDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    submit: Mutex<SubmitContext>,
    device_name: String,
    // Keeps the instance alive until the device is destroyed.
    _instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    pub fn new(instance: Arc<VulkanInstance>, info: &PhysicalDeviceInfo) -> Result<Self> {
        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(info.queue_family_index)
            .queue_priorities(&queue_priorities);
        let queue_create_infos = [queue_create_info];

        #[allow(unused_mut)]
        let mut device_extensions: Vec<*const c_char> = Vec::new();

        // On macOS/iOS, we need portability subset
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            device_extensions.push(c"VK_KHR_portability_subset".as_ptr());
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extensions);

        let device = unsafe {
            instance
                .handle()
                .create_device(info.handle, &device_create_info, None)
        }
        .map_err(|e| vk_error("create logical device", e))?;

        let queue = unsafe { device.get_device_queue(info.queue_family_index, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(info.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(vk_error("create command pool", e));
            }
        };

        tracing::info!(
            "Vulkan device initialized: {} (queue family {})",
            info.descriptor.name,
            info.queue_family_index
        );

        Ok(Self {
            device,
            memory_properties: info.memory_properties,
            submit: Mutex::new(SubmitContext {
                queue,
                command_pool,
            }),
            device_name: info.descriptor.name.clone(),
            _instance: instance,
        })
    }

    /// Record into a one-time command buffer, submit, and block until the
    /// queue has executed it.
    pub fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let ctx = self.submit.lock();
        commands::submit_one_time(&self.device, &ctx, record)
    }

    /// Wait until the queue is idle.
    pub fn wait_idle(&self) -> Result<()> {
        let ctx = self.submit.lock();
        unsafe { self.device.queue_wait_idle(ctx.queue) }
            .map_err(|e| vk_error("wait for queue idle", e))
    }

    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let ctx = self.submit.get_mut();
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("{}: device_wait_idle during teardown: {}", self.device_name, e);
            }
            self.device.destroy_command_pool(ctx.command_pool, None);
            self.device.destroy_device(None);
        }
        tracing::debug!("Vulkan device destroyed: {}", self.device_name);
    }
}

// VulkanDevice is Send + Sync because Vulkan handles are thread-safe
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}
