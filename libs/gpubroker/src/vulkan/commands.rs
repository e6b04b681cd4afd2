// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! One-time command buffer submission.

use ash::vk;

use crate::error::{BrokerError, Result};

use super::vk_error;

/// Queue and pool of one logical device. Guarded by the device's mutex.
pub struct SubmitContext {
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
}

/// Allocate a primary command buffer, record it, submit it with a fence and
/// wait without timeout. The command buffer is freed on every path.
pub fn submit_one_time<F>(device: &ash::Device, ctx: &SubmitContext, record: F) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(ctx.command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
        .map_err(|e| vk_error("allocate command buffer", e))?
        .into_iter()
        .next()
        .ok_or_else(|| BrokerError::driver("Driver returned no command buffer"))?;

    let result = record_and_submit(device, ctx.queue, command_buffer, record);

    unsafe { device.free_command_buffers(ctx.command_pool, &[command_buffer]) };

    result
}

fn record_and_submit<F>(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffer: vk::CommandBuffer,
    record: F,
) -> Result<()>
where
    F: FnOnce(&ash::Device, vk::CommandBuffer),
{
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
        .map_err(|e| vk_error("begin command buffer", e))?;

    record(device, command_buffer);

    unsafe { device.end_command_buffer(command_buffer) }
        .map_err(|e| vk_error("end command buffer", e))?;

    let fence = Fence::new(device)?;
    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

    unsafe { device.queue_submit(queue, &[submit_info], fence.handle) }
        .map_err(|e| vk_error("submit command buffer", e))?;

    unsafe { device.wait_for_fences(&[fence.handle], true, u64::MAX) }
        .map_err(|e| vk_error("wait for fence", e))
}

/// Unsignaled fence destroyed when the submission scope ends.
struct Fence<'a> {
    device: &'a ash::Device,
    handle: vk::Fence,
}

impl<'a> Fence<'a> {
    fn new(device: &'a ash::Device) -> Result<Self> {
        let handle = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| vk_error("create fence", e))?;
        Ok(Self { device, handle })
    }
}

impl Drop for Fence<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.handle, None) };
    }
}

/// Make transfer writes visible to host reads after the fence signals.
pub fn transfer_to_host_barrier(device: &ash::Device, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ);

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Order a copy after earlier transfer writes to the same buffers.
pub fn transfer_barrier(device: &ash::Device, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE);

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}
