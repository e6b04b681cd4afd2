// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Several threads driving one broker.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use gpubroker::{BrokerConfig, GpuBroker, HostDeviceConfig, HostDriver};

const THREADS: usize = 8;
const PER_THREAD: usize = 64;

fn shared_broker() -> Arc<GpuBroker<HostDriver>> {
    let mut config = BrokerConfig::default();
    config.host.devices = vec![HostDeviceConfig {
        name: "sim-shared".into(),
        memory_bytes: 64 * 1024 * 1024,
        compute_units: 4,
    }];
    let broker = Arc::new(GpuBroker::new(config));
    broker.initialize().unwrap();
    broker
}

#[test]
fn test_concurrent_allocations_yield_unique_tokens() {
    let broker = shared_broker();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let broker = Arc::clone(&broker);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..PER_THREAD)
                    .map(|_| broker.allocate(0, 256).unwrap().to_raw())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut tokens = HashSet::new();
    for handle in handles {
        for token in handle.join().unwrap() {
            assert_ne!(token, 0);
            assert!(tokens.insert(token), "duplicate handle token {token:#x}");
        }
    }
    assert_eq!(tokens.len(), THREADS * PER_THREAD);
    assert_eq!(broker.live_allocations().unwrap(), THREADS * PER_THREAD);
    assert_eq!(broker.memory_info(0).unwrap().used_bytes, (THREADS * PER_THREAD * 256) as u64);
}

#[test]
fn test_concurrent_transfers_keep_their_own_data() {
    let broker = shared_broker();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                let pattern = vec![t as u8; 4096];
                for _ in 0..16 {
                    let handle = broker.allocate(0, 4096).unwrap();
                    broker.copy_to_device(handle, &pattern).unwrap();
                    assert_eq!(broker.copy_from_device(handle, 4096).unwrap(), pattern);
                    assert_eq!(broker.device_name(0).unwrap(), "sim-shared");
                    broker.free(handle).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(broker.live_allocations().unwrap(), 0);
    assert_eq!(broker.memory_info(0).unwrap().used_bytes, 0);
}

#[test]
fn test_shutdown_races_with_allocations_safely() {
    let broker = shared_broker();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                for _ in 0..100 {
                    // Either succeeds or reports NotInitialized; never panics.
                    if let Ok(handle) = broker.allocate(0, 64) {
                        let _ = broker.copy_to_device(handle, &[1; 64]);
                        let _ = broker.free(handle);
                    }
                }
            })
        })
        .collect();

    broker.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(!broker.is_initialized());
}
