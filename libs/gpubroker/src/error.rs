// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("GPU backend not initialized")]
    NotInitialized,

    #[error("Invalid device index {index} (session has {count} devices)")]
    InvalidDeviceIndex { index: usize, count: usize },

    #[error("Invalid allocation handle: {0}")]
    InvalidHandle(String),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Size mismatch: requested {requested} bytes, capacity is {capacity} bytes")]
    SizeMismatch { requested: u64, capacity: u64 },

    #[error("GPU driver error: {message}")]
    DriverError { message: String, device_lost: bool },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Driver failure that does not indicate a lost device.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::DriverError {
            message: message.into(),
            device_lost: false,
        }
    }

    /// Stable numeric code reported across the C ABI. `0` is reserved for "no error".
    pub fn code(&self) -> i32 {
        match self {
            Self::NotInitialized => 1,
            Self::InvalidDeviceIndex { .. } => 2,
            Self::InvalidHandle(_) => 3,
            Self::AllocationFailed(_) => 4,
            Self::SizeMismatch { .. } => 5,
            Self::DriverError { .. } => 6,
            Self::Configuration(_) => 7,
            Self::Io(_) => 8,
            Self::InvalidArgument(_) => 9,
        }
    }

    /// True when the driver reported the device as lost; the caller should
    /// shut down and re-initialize.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            Self::DriverError {
                device_lost: true,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
