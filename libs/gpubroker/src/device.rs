// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device descriptors and enumeration sessions.

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// GPU vendor decoded from the PCI vendor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    #[serde(rename = "NVIDIA")]
    Nvidia,
    #[serde(rename = "AMD")]
    Amd,
    Apple,
    Intel,
    #[serde(rename = "ARM")]
    Arm,
    Qualcomm,
    #[serde(rename = "ImgTec")]
    ImgTec,
    Unknown,
}

impl Vendor {
    pub fn from_pci_id(vendor_id: u32) -> Self {
        match vendor_id {
            0x10DE => Self::Nvidia,
            0x1002 | 0x1022 => Self::Amd,
            0x106B => Self::Apple,
            0x8086 => Self::Intel,
            0x13B5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            0x1010 => Self::ImgTec,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvidia => "NVIDIA",
            Self::Amd => "AMD",
            Self::Apple => "Apple",
            Self::Intel => "Intel",
            Self::Arm => "ARM",
            Self::Qualcomm => "Qualcomm",
            Self::ImgTec => "ImgTec",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discrete => "Discrete GPU",
            Self::Integrated => "Integrated GPU",
            Self::Virtual => "Virtual GPU",
            Self::Cpu => "CPU",
            Self::Other => "Other",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one device, valid for the enumeration session that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Ordinal within the enumeration session.
    pub index: usize,
    pub name: String,
    pub vendor: Vendor,
    pub device_type: DeviceType,
    /// Total device-local memory.
    pub memory_bytes: u64,
    /// Parallel execution units (SMs, CUs, or an estimate).
    pub compute_units: u32,
    pub driver_version: String,
    pub api_version: String,
}

/// One snapshot of the device list. Indices are only meaningful within it.
#[derive(Debug, Clone)]
pub(crate) struct EnumerationSession {
    id: u64,
    devices: Vec<DeviceDescriptor>,
}

impl EnumerationSession {
    pub(crate) fn new(id: u64, devices: Vec<DeviceDescriptor>) -> Self {
        Self { id, devices }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Descriptor at `index`, or `InvalidDeviceIndex`.
    pub fn get(&self, index: usize) -> Result<&DeviceDescriptor> {
        self.devices
            .get(index)
            .ok_or(BrokerError::InvalidDeviceIndex {
                index,
                count: self.devices.len(),
            })
    }
}

/// JSON document handed across the boundary: `{"devices":[...],"count":n}`.
#[derive(Debug, Serialize)]
pub struct DeviceListing<'a> {
    pub devices: &'a [DeviceDescriptor],
    pub count: usize,
}

impl<'a> DeviceListing<'a> {
    pub fn new(devices: &'a [DeviceDescriptor]) -> Self {
        Self {
            devices,
            count: devices.len(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| BrokerError::driver(format!("Failed to serialize device list: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(index: usize, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: name.to_string(),
            vendor: Vendor::Nvidia,
            device_type: DeviceType::Discrete,
            memory_bytes: 8 << 30,
            compute_units: 46,
            driver_version: "550.54.14".to_string(),
            api_version: "1.3.277".to_string(),
        }
    }

    #[test]
    fn test_vendor_ids() {
        assert_eq!(Vendor::from_pci_id(0x10DE), Vendor::Nvidia);
        assert_eq!(Vendor::from_pci_id(0x1002), Vendor::Amd);
        assert_eq!(Vendor::from_pci_id(0x106B), Vendor::Apple);
        assert_eq!(Vendor::from_pci_id(0x8086), Vendor::Intel);
        assert_eq!(Vendor::from_pci_id(0x13B5), Vendor::Arm);
        assert_eq!(Vendor::from_pci_id(0xFFFF), Vendor::Unknown);
    }

    #[test]
    fn test_session_lookup() {
        let session = EnumerationSession::new(7, vec![descriptor(0, "a"), descriptor(1, "b")]);
        assert_eq!(session.id(), 7);
        assert_eq!(session.get(1).unwrap().name, "b");
        assert!(matches!(
            session.get(2),
            Err(BrokerError::InvalidDeviceIndex { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_listing_json_shape() {
        let devices = vec![descriptor(0, "GeForce RTX 3060")];
        let json = DeviceListing::new(&devices).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["count"], 1);
        assert_eq!(value["devices"][0]["name"], "GeForce RTX 3060");
        assert_eq!(value["devices"][0]["vendor"], "NVIDIA");
        assert_eq!(value["devices"][0]["device_type"], "discrete");
        assert_eq!(value["devices"][0]["memory_bytes"], 8u64 << 30);
        // Key order is preserved: devices before count.
        assert!(json.find("\"devices\"").unwrap() < json.find("\"count\"").unwrap());
    }
}
