// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Broker configuration via `gpubroker.toml`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{BrokerError, Result};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Broker configuration from `gpubroker.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Driver backend. When unset, `GPUBROKER_BACKEND` or the platform default applies.
    pub backend: Option<BackendKind>,

    /// Use the host backend when the Vulkan driver cannot be brought up.
    pub fallback_to_host: bool,

    /// Application name reported to the Vulkan loader.
    pub application_name: String,

    /// Requested Vulkan API version as `"major.minor"`.
    pub api_version: String,

    /// Enable `VK_LAYER_KHRONOS_validation` when the layer is installed.
    pub enable_validation: bool,

    /// Pick the first discrete GPU as the default device.
    pub prefer_discrete: bool,

    /// Upper bound on a single staging buffer; larger transfers are chunked.
    pub staging_chunk_bytes: u64,

    /// Reported compute units for devices that expose no core-count extension.
    pub default_compute_units: u32,

    /// `tracing` filter used when neither `GPUBROKER_LOG` nor `RUST_LOG` is set.
    pub log_filter: String,

    /// Devices simulated by the host backend.
    pub host: HostConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: None,
            fallback_to_host: false,
            application_name: "gpubroker".to_string(),
            api_version: "1.1".to_string(),
            enable_validation: false,
            prefer_discrete: true,
            staging_chunk_bytes: 64 * MIB,
            default_compute_units: 16,
            log_filter: "info".to_string(),
            host: HostConfig::default(),
        }
    }
}

/// Host backend device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub devices: Vec<HostDeviceConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        let compute_units = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            devices: vec![HostDeviceConfig {
                name: "Host Memory".to_string(),
                memory_bytes: GIB,
                compute_units,
            }],
        }
    }
}

/// One simulated host device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDeviceConfig {
    pub name: String,
    pub memory_bytes: u64,
    #[serde(default = "default_host_compute_units")]
    pub compute_units: u32,
}

fn default_host_compute_units() -> u32 {
    1
}

impl BrokerConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "gpubroker.toml";

    /// Environment variable naming a configuration file to load.
    pub const ENV_VAR: &'static str = "GPUBROKER_CONFIG";

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BrokerError::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file. Returns error if the file is missing,
    /// cannot be parsed, or fails validation.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path).map_err(|e| {
            BrokerError::Configuration(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        let config = Self::parse(&content).map_err(|e| match e {
            BrokerError::Configuration(msg) => {
                BrokerError::Configuration(format!("{}: {}", config_path.display(), msg))
            }
            other => other,
        })?;

        tracing::info!("Loaded broker config from {}", config_path.display());
        Ok(config)
    }

    /// Load `gpubroker.toml` from a directory, returning defaults if the file
    /// is missing or invalid.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default();
        }

        match Self::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load the file named by `GPUBROKER_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(Self::ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Backend to bring up, after environment and platform-default resolution.
    pub fn resolved_backend(&self) -> BackendKind {
        BackendKind::resolve(self.backend)
    }

    /// `(major, minor)` parsed from `api_version`.
    pub fn api_version_parts(&self) -> Result<(u32, u32)> {
        let invalid = || {
            BrokerError::Configuration(format!(
                "api_version '{}' is not of the form major.minor",
                self.api_version
            ))
        };
        let (major, minor) = self.api_version.trim().split_once('.').ok_or_else(invalid)?;
        let major = major.parse::<u32>().map_err(|_| invalid())?;
        let minor = minor.parse::<u32>().map_err(|_| invalid())?;
        if major != 1 {
            return Err(BrokerError::Configuration(format!(
                "Unsupported Vulkan major version {major}"
            )));
        }
        Ok((major, minor))
    }

    pub fn validate(&self) -> Result<()> {
        if self.staging_chunk_bytes == 0 {
            return Err(BrokerError::Configuration(
                "staging_chunk_bytes must be greater than zero".into(),
            ));
        }
        self.api_version_parts()?;
        for device in &self.host.devices {
            if device.memory_bytes == 0 {
                return Err(BrokerError::Configuration(format!(
                    "host device '{}' has zero memory_bytes",
                    device.name
                )));
            }
        }
        Ok(())
    }
}
