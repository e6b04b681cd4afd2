// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Driver backend selection with runtime resolution.
//!
//! The backend can be selected at runtime via:
//! 1. Explicit value (configuration or `BackendKind::resolve()` argument)
//! 2. `GPUBROKER_BACKEND` environment variable
//! 3. Platform default (Vulkan)

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Driver backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Vulkan compute devices through the system loader.
    Vulkan,
    /// Host-memory devices described by configuration.
    Host,
}

impl BackendKind {
    /// Environment variable name for backend override.
    pub const ENV_VAR: &'static str = "GPUBROKER_BACKEND";

    /// Resolve the backend to use.
    ///
    /// Resolution priority:
    /// 1. Explicit value (if provided)
    /// 2. `GPUBROKER_BACKEND` environment variable
    /// 3. Platform default
    pub fn resolve(explicit: Option<Self>) -> Self {
        if let Some(backend) = explicit {
            return backend;
        }

        if let Some(backend) = Self::from_env() {
            return backend;
        }

        Self::platform_default()
    }

    /// Backend named by `GPUBROKER_BACKEND`, if set to a known value.
    pub fn from_env() -> Option<Self> {
        let value = std::env::var(Self::ENV_VAR).ok()?;
        match value.parse() {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::warn!("Ignoring {}: {}", Self::ENV_VAR, e);
                None
            }
        }
    }

    /// Get the platform default backend.
    pub fn platform_default() -> Self {
        Self::Vulkan
    }

    /// Get the backend name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vulkan => "vulkan",
            Self::Host => "host",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vulkan" | "vk" => Ok(Self::Vulkan),
            "host" | "cpu" => Ok(Self::Host),
            _ => Err(format!(
                "Unknown backend '{}'. Valid values: vulkan, host",
                s
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Vulkan".parse::<BackendKind>(), Ok(BackendKind::Vulkan));
        assert_eq!("vk".parse::<BackendKind>(), Ok(BackendKind::Vulkan));
        assert_eq!(" cpu ".parse::<BackendKind>(), Ok(BackendKind::Host));
        assert!("metal".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_explicit_wins() {
        assert_eq!(
            BackendKind::resolve(Some(BackendKind::Host)),
            BackendKind::Host
        );
    }

    #[test]
    fn test_display_round_trips() {
        for kind in [BackendKind::Vulkan, BackendKind::Host] {
            assert_eq!(kind.to_string().parse::<BackendKind>(), Ok(kind));
        }
    }
}
