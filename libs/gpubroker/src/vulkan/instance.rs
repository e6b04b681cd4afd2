// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Vulkan instance and physical device probing.

use std::ffi::{CStr, CString, c_char};

use ash::vk;

use crate::config::BrokerConfig;
use crate::device::{DeviceDescriptor, DeviceType, Vendor};
use crate::error::{BrokerError, Result};

use super::vk_error;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const NV_SM_BUILTINS: &CStr = c"VK_NV_shader_sm_builtins";
const AMD_SHADER_CORE_PROPERTIES: &CStr = c"VK_AMD_shader_core_properties";

/// Loaded Vulkan entry points plus the instance created from them.
pub(crate) struct VulkanInstance {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    api_version: u32,
}

/// A compute-capable physical device and what the broker needs to drive it.
#[derive(Clone)]
pub(crate) struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub queue_family_index: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub descriptor: DeviceDescriptor,
}

impl VulkanInstance {
    /// Load the system Vulkan loader and create an instance.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let (major, minor) = config.api_version_parts()?;

        // 1. Load Vulkan entry points (via MoltenVK on macOS)
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            BrokerError::driver(format!(
                "Failed to load Vulkan loader. On macOS, ensure MoltenVK is installed: {e}"
            ))
        })?;

        // 2. Enumerate available instance extensions
        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
            .map_err(|e| vk_error("enumerate instance extensions", e))?;

        #[allow(unused_variables)]
        let available_ext_names: Vec<&CStr> = available_extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();

        #[allow(unused_mut)]
        let mut instance_extensions: Vec<*const c_char> = Vec::new();
        #[allow(unused_mut)]
        let mut instance_create_flags = vk::InstanceCreateFlags::empty();

        // MoltenVK only lists its devices with portability enumeration.
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            let portability_enum = c"VK_KHR_portability_enumeration";
            if available_ext_names.contains(&portability_enum) {
                instance_extensions.push(portability_enum.as_ptr());
                instance_create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
            }
        }

        // 3. Optional validation layer
        let mut layers: Vec<*const c_char> = Vec::new();
        if config.enable_validation {
            let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
                .map_err(|e| vk_error("enumerate instance layers", e))?;
            let has_validation = available_layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
            if has_validation {
                layers.push(VALIDATION_LAYER.as_ptr());
                tracing::info!("Vulkan validation layer enabled");
            } else {
                tracing::warn!("enable_validation is set but VK_LAYER_KHRONOS_validation is not installed");
            }
        }

        // 4. Create Vulkan instance
        let app_name = CString::new(config.application_name.as_str()).map_err(|_| {
            BrokerError::Configuration("application_name contains a NUL byte".into())
        })?;
        let api_version = vk::make_api_version(0, major, minor, 0);
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"gpubroker")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&instance_extensions)
            .enabled_layer_names(&layers)
            .flags(instance_create_flags);

        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| vk_error("create Vulkan instance", e))?;

        tracing::info!("Vulkan instance created (API {}.{})", major, minor);

        Ok(Self {
            entry,
            instance,
            api_version,
        })
    }

    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Every physical device with a compute-capable queue family, in driver order.
    pub fn physical_devices(&self, default_compute_units: u32) -> Result<Vec<PhysicalDeviceInfo>> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(|e| vk_error("enumerate physical devices", e))?;

        let mut usable = Vec::with_capacity(physical_devices.len());
        for handle in physical_devices {
            match self.describe(handle, usable.len(), default_compute_units) {
                Some(info) => usable.push(info),
                None => {
                    let props = unsafe { self.instance.get_physical_device_properties(handle) };
                    tracing::debug!(
                        "Skipping {}: no compute queue family",
                        device_name(&props)
                    );
                }
            }
        }
        Ok(usable)
    }

    /// Re-read properties for an already listed device.
    pub fn refresh(&self, info: &PhysicalDeviceInfo, default_compute_units: u32) -> PhysicalDeviceInfo {
        self.describe(info.handle, info.descriptor.index, default_compute_units)
            .unwrap_or_else(|| info.clone())
    }

    fn describe(
        &self,
        handle: vk::PhysicalDevice,
        index: usize,
        default_compute_units: u32,
    ) -> Option<PhysicalDeviceInfo> {
        let props = unsafe { self.instance.get_physical_device_properties(handle) };

        let queue_families =
            unsafe { self.instance.get_physical_device_queue_family_properties(handle) };
        let queue_family_index = queue_families
            .iter()
            .position(|family| {
                family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            })? as u32;

        let memory_properties =
            unsafe { self.instance.get_physical_device_memory_properties(handle) };

        let vendor = Vendor::from_pci_id(props.vendor_id);
        let descriptor = DeviceDescriptor {
            index,
            name: device_name(&props),
            vendor,
            device_type: device_type(props.device_type),
            memory_bytes: device_local_bytes(&memory_properties),
            compute_units: self
                .query_compute_units(handle, &props)
                .unwrap_or(default_compute_units),
            driver_version: format_driver_version(vendor, props.driver_version),
            api_version: format!(
                "{}.{}.{}",
                vk::api_version_major(props.api_version),
                vk::api_version_minor(props.api_version),
                vk::api_version_patch(props.api_version)
            ),
        };

        Some(PhysicalDeviceInfo {
            handle,
            queue_family_index,
            memory_properties,
            descriptor,
        })
    }

    /// SM or CU count from vendor extensions. Needs Vulkan 1.1 on both sides.
    fn query_compute_units(
        &self,
        handle: vk::PhysicalDevice,
        props: &vk::PhysicalDeviceProperties,
    ) -> Option<u32> {
        let v1_1 = vk::make_api_version(0, 1, 1, 0);
        if self.api_version < v1_1 || props.api_version < v1_1 {
            return None;
        }

        let extensions =
            unsafe { self.instance.enumerate_device_extension_properties(handle) }.ok()?;
        let has = |name: &CStr| {
            extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(name))
        };

        if has(NV_SM_BUILTINS) {
            let mut sm = vk::PhysicalDeviceShaderSMBuiltinsPropertiesNV::default();
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut sm);
            unsafe {
                self.instance
                    .get_physical_device_properties2(handle, &mut props2)
            };
            return (sm.shader_sm_count > 0).then_some(sm.shader_sm_count);
        }

        if has(AMD_SHADER_CORE_PROPERTIES) {
            let mut core = vk::PhysicalDeviceShaderCorePropertiesAMD::default();
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut core);
            unsafe {
                self.instance
                    .get_physical_device_properties2(handle, &mut props2)
            };
            let units = core.shader_engine_count
                * core.shader_arrays_per_engine_count
                * core.compute_units_per_shader_array;
            return (units > 0).then_some(units);
        }

        None
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            self.instance.destroy_instance(None);
        }
        tracing::debug!("Vulkan instance destroyed");
    }
}

// VulkanInstance is Send + Sync because Vulkan handles are thread-safe
unsafe impl Send for VulkanInstance {}
unsafe impl Sync for VulkanInstance {}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "Unknown device".to_string())
}

fn device_type(kind: vk::PhysicalDeviceType) -> DeviceType {
    match kind {
        vk::PhysicalDeviceType::DISCRETE_GPU => DeviceType::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceType::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceType::Virtual,
        vk::PhysicalDeviceType::CPU => DeviceType::Cpu,
        _ => DeviceType::Other,
    }
}

/// Sum of every `DEVICE_LOCAL` heap.
fn device_local_bytes(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    memory.memory_heaps[..memory.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

/// NVIDIA packs its driver version as 10.8.8.6 bits; everyone else uses the
/// Vulkan version encoding.
fn format_driver_version(vendor: Vendor, raw: u32) -> String {
    match vendor {
        Vendor::Nvidia => format!(
            "{}.{}.{}.{}",
            (raw >> 22) & 0x3ff,
            (raw >> 14) & 0xff,
            (raw >> 6) & 0xff,
            raw & 0x3f
        ),
        _ => format!(
            "{}.{}.{}",
            vk::api_version_major(raw),
            vk::api_version_minor(raw),
            vk::api_version_patch(raw)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nvidia_driver_version() {
        // 550.54.14.0
        let raw = (550 << 22) | (54 << 14) | (14 << 6);
        assert_eq!(format_driver_version(Vendor::Nvidia, raw), "550.54.14.0");
        assert_eq!(
            format_driver_version(Vendor::Amd, vk::make_api_version(0, 2, 0, 279)),
            "2.0.279"
        );
    }

    #[test]
    fn test_device_local_heaps_are_summed() {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 3,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 8 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 16 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory.memory_heaps[2] = vk::MemoryHeap {
            size: 256 << 20,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        assert_eq!(device_local_bytes(&memory), (8 << 30) + (256 << 20));
    }

    #[test]
    fn test_instance_lists_physical_devices() {
        let instance = match VulkanInstance::new(&BrokerConfig::default()) {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!("Skipping test - Vulkan not available: {e}");
                return;
            }
        };

        let devices = instance.physical_devices(16).unwrap();
        for (i, info) in devices.iter().enumerate() {
            assert_eq!(info.descriptor.index, i);
            assert!(!info.descriptor.name.is_empty());
            assert!(info.descriptor.compute_units > 0);
        }
    }
}
