// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vulkan driver.

mod buffer;
mod commands;
mod device;
mod driver;
mod instance;

pub use driver::{VulkanAllocation, VulkanDriver};

use ash::vk;

use crate::error::BrokerError;

/// Map a failed Vulkan call to a driver error, flagging lost devices.
pub(crate) fn vk_error(what: &str, result: vk::Result) -> BrokerError {
    BrokerError::DriverError {
        message: format!("Failed to {what}: {result}"),
        device_lost: result == vk::Result::ERROR_DEVICE_LOST,
    }
}

/// Like [`vk_error`], but out-of-memory results become `AllocationFailed`.
pub(crate) fn vk_alloc_error(what: &str, result: vk::Result) -> BrokerError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            BrokerError::AllocationFailed(format!("Failed to {what}: {result}"))
        }
        other => vk_error(what, other),
    }
}
