// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Broker lifecycle, enumeration and transfer behaviour on the host backend.

use gpubroker::{
    AllocationHandle, BackendKind, BrokerConfig, BrokerError, GpuBroker, HostDeviceConfig,
    HostDriver, ShutdownReport,
};

fn host_config() -> BrokerConfig {
    let mut config = BrokerConfig {
        backend: Some(BackendKind::Host),
        ..BrokerConfig::default()
    };
    config.host.devices = vec![
        HostDeviceConfig {
            name: "sim-discrete".into(),
            memory_bytes: 64 * 1024,
            compute_units: 40,
        },
        HostDeviceConfig {
            name: "sim-integrated".into(),
            memory_bytes: 4 * 1024,
            compute_units: 8,
        },
    ];
    config
}

fn initialized() -> GpuBroker<HostDriver> {
    let broker = GpuBroker::new(host_config());
    broker.initialize().expect("host backend initializes");
    broker
}

#[test]
fn test_descriptor_queries_are_consistent_within_session() {
    let broker = initialized();
    let devices = broker.enumerate_devices().unwrap();
    assert_eq!(devices.len(), 2);

    for device in &devices {
        for _ in 0..3 {
            assert_eq!(broker.device_name(device.index).unwrap(), device.name);
            assert_eq!(broker.device_memory(device.index).unwrap(), device.memory_bytes);
            assert_eq!(broker.compute_units(device.index).unwrap(), device.compute_units);
        }
    }

    assert!(matches!(
        broker.device_name(devices.len()),
        Err(BrokerError::InvalidDeviceIndex { .. })
    ));
    assert!(broker.device_memory(usize::MAX).is_err());
    assert!(broker.compute_units(17).is_err());
}

#[test]
fn test_zero_size_allocation_fails() {
    let broker = initialized();
    for device in broker.enumerate_devices().unwrap() {
        assert!(matches!(
            broker.allocate(device.index, 0),
            Err(BrokerError::AllocationFailed(_))
        ));
    }
    assert_eq!(broker.live_allocations().unwrap(), 0);
}

#[test]
fn test_allocate_then_free_within_capacity() {
    let broker = initialized();
    for device in broker.enumerate_devices().unwrap() {
        for size in [1, 4096, device.memory_bytes] {
            let handle = broker.allocate(device.index, size).unwrap();
            broker.free(handle).unwrap();
        }
        assert!(broker.allocate(device.index, device.memory_bytes + 1).is_err());
    }
}

#[test]
fn test_invalid_device_index_fails_allocation() {
    let broker = initialized();
    assert!(matches!(
        broker.allocate(2, 16),
        Err(BrokerError::InvalidDeviceIndex { index: 2, count: 2 })
    ));
}

#[test]
fn test_freed_handle_is_rejected_everywhere() {
    let broker = initialized();
    let handle = broker.allocate(0, 32).unwrap();
    broker.copy_to_device(handle, b"payload").unwrap();
    broker.free(handle).unwrap();

    assert!(matches!(
        broker.copy_to_device(handle, b"x"),
        Err(BrokerError::InvalidHandle(_))
    ));
    assert!(matches!(
        broker.copy_from_device(handle, 1),
        Err(BrokerError::InvalidHandle(_))
    ));
    assert!(matches!(broker.free(handle), Err(BrokerError::InvalidHandle(_))));
    assert!(broker.allocation_info(handle).is_err());
}

#[test]
fn test_stale_handle_never_resolves_after_slot_reuse() {
    let broker = initialized();
    let stale = broker.allocate(0, 16).unwrap();
    broker.free(stale).unwrap();

    let fresh = broker.allocate(0, 16).unwrap();
    assert_ne!(stale, fresh);
    broker.copy_to_device(fresh, b"fresh").unwrap();

    assert!(broker.copy_from_device(stale, 5).is_err());
    assert_eq!(broker.copy_from_device(fresh, 5).unwrap(), b"fresh");
}

#[test]
fn test_round_trip_fidelity() {
    let broker = initialized();
    let handle = broker.allocate(0, 8192).unwrap();

    let data: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 256) as u8).collect();
    broker.copy_to_device(handle, &data).unwrap();
    assert_eq!(broker.copy_from_device(handle, data.len() as u64).unwrap(), data);

    // Reads may be shorter than what was written.
    assert_eq!(broker.copy_from_device(handle, 10).unwrap(), &data[..10]);
}

#[test]
fn test_transfer_size_limits() {
    let broker = initialized();
    let handle = broker.allocate(1, 4).unwrap();

    assert!(matches!(
        broker.copy_to_device(handle, b"too long"),
        Err(BrokerError::SizeMismatch {
            requested: 8,
            capacity: 4
        })
    ));
    assert!(matches!(
        broker.copy_from_device(handle, 5),
        Err(BrokerError::SizeMismatch { .. })
    ));

    // Handle stays usable after a rejected transfer.
    broker.copy_to_device(handle, b"ok").unwrap();
    assert_eq!(broker.copy_from_device(handle, 2).unwrap(), b"ok");
    assert!(broker.copy_from_device(handle, 0).unwrap().is_empty());
    broker.copy_to_device(handle, &[]).unwrap();
}

#[test]
fn test_device_to_device_copy() {
    let broker = initialized();
    let src = broker.allocate(0, 16).unwrap();
    let dst = broker.allocate(1, 8).unwrap();

    broker.copy_to_device(src, b"0123456789abcdef").unwrap();
    broker.copy_device_to_device(src, dst, 8).unwrap();
    assert_eq!(broker.copy_from_device(dst, 8).unwrap(), b"01234567");

    assert!(matches!(
        broker.copy_device_to_device(src, dst, 16),
        Err(BrokerError::SizeMismatch { .. })
    ));
    broker.copy_device_to_device(src, src, 16).unwrap();
    broker.synchronize(0).unwrap();
    broker.synchronize(1).unwrap();
    assert!(broker.synchronize(2).is_err());
}

#[test]
fn test_shutdown_reclaims_and_disables_everything() {
    let broker = initialized();
    let a = broker.allocate(0, 100).unwrap();
    let _b = broker.allocate(1, 50).unwrap();

    let report = broker.shutdown();
    assert_eq!(report.allocations_released, 2);
    assert_eq!(report.bytes_released, 150);

    assert!(matches!(broker.enumerate_devices(), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.device_name(0), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.device_memory(0), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.compute_units(0), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.allocate(0, 1), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.free(a), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.copy_to_device(a, b"x"), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.copy_from_device(a, 1), Err(BrokerError::NotInitialized)));
    assert!(matches!(broker.memory_info(0), Err(BrokerError::NotInitialized)));

    // Second shutdown is a no-op.
    assert_eq!(broker.shutdown().allocations_released, 0);

    // Handles from the previous context stay dead after re-initialization.
    broker.initialize().unwrap();
    assert_eq!(broker.live_allocations().unwrap(), 0);
    let fresh = broker.allocate(0, 100).unwrap();
    assert_ne!(fresh, a);
    assert!(broker.copy_from_device(a, 1).is_err());
    assert!(broker.free(a).is_err());
    broker.free(fresh).unwrap();
}

#[test]
fn test_shutdown_without_initialize_is_noop() {
    let broker: GpuBroker<HostDriver> = GpuBroker::new(host_config());
    assert_eq!(broker.shutdown(), ShutdownReport::default());
    assert!(!broker.is_initialized());
}

#[test]
fn test_initialize_twice_equals_once() {
    let broker = initialized();
    let handle = broker.allocate(0, 64).unwrap();
    let session = broker.session_id().unwrap();

    broker.initialize().unwrap();
    assert_eq!(broker.session_id().unwrap(), session);
    assert_eq!(broker.live_allocations().unwrap(), 1);
    broker.free(handle).unwrap();
}

#[test]
fn test_empty_host_device_list_fails_initialize() {
    let mut config = host_config();
    config.host.devices.clear();
    let broker: GpuBroker<HostDriver> = GpuBroker::new(config);

    assert!(matches!(
        broker.initialize(),
        Err(BrokerError::DriverError { .. })
    ));
    assert!(!broker.is_initialized());
}

#[test]
fn test_handle_token_round_trip_through_broker() {
    let broker = initialized();
    let handle = broker.allocate(0, 8).unwrap();

    let token = handle.to_raw();
    let restored = AllocationHandle::from_raw(token).unwrap();
    broker.copy_to_device(restored, b"token").unwrap();
    assert_eq!(broker.copy_from_device(handle, 5).unwrap(), b"token");

    let parsed: AllocationHandle = handle.to_string().parse().unwrap();
    broker.free(parsed).unwrap();
}
