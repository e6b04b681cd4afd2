// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The broker: lifecycle, device queries, allocation and transfers.
//!
//! All mutable state lives in one `RwLock<BrokerState>`; a missing backend
//! means "not initialized". Mutations take the write lock. Queries and device
//! reads share the read lock.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::backend::BackendKind;
use crate::config::BrokerConfig;
use crate::device::{DeviceDescriptor, EnumerationSession};
use crate::driver::{GpuDriver, SelectedDriver, host_buffer};
use crate::error::{BrokerError, Result};
use crate::memory::{
    AllocationHandle, AllocationInfo, AllocationRecord, AllocationState, AllocationTable,
    MemoryInfo, ShutdownReport,
};

/// Explicit backend context. One per process is the owner's responsibility.
pub struct GpuBroker<D: GpuDriver = SelectedDriver> {
    config: RwLock<BrokerConfig>,
    state: RwLock<BrokerState<D>>,
    next_session: AtomicU64,
}

/// The allocation table outlives individual backends: draining it bumps slot
/// generations, so handles from a torn-down backend never resolve again.
struct BrokerState<D: GpuDriver> {
    allocations: AllocationTable<D::Allocation>,
    backend: Option<Backend<D>>,
}

struct Backend<D> {
    session: EnumerationSession,
    driver: D,
}

impl<D: GpuDriver> BrokerState<D> {
    fn backend(&self) -> Result<&Backend<D>> {
        self.backend.as_ref().ok_or(BrokerError::NotInitialized)
    }

    /// Release every live allocation through the driver.
    fn sweep(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let Some(backend) = self.backend.as_ref() else {
            return report;
        };
        for record in self.allocations.drain() {
            report.allocations_released += 1;
            report.bytes_released += record.size_bytes;
            backend.driver.free(record.native);
        }
        report
    }
}

impl<D: GpuDriver> Drop for BrokerState<D> {
    fn drop(&mut self) {
        let report = self.sweep();
        if report.allocations_released > 0 {
            tracing::warn!(
                "Reclaimed {} leaked allocation(s) ({} bytes) at teardown",
                report.allocations_released,
                report.bytes_released
            );
        }
    }
}

impl<D: GpuDriver> Default for GpuBroker<D> {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl<D: GpuDriver> GpuBroker<D> {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: RwLock::new(BrokerState {
                allocations: AllocationTable::default(),
                backend: None,
            }),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> BrokerConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Only allowed while uninitialized.
    pub fn reconfigure(&self, config: BrokerConfig) -> Result<()> {
        config.validate()?;
        // Held across the check so a concurrent initialize cannot interleave.
        let state = self.state.write();
        if state.backend.is_some() {
            return Err(BrokerError::Configuration(
                "Cannot reconfigure an initialized broker; shut it down first".into(),
            ));
        }
        *self.config.write() = config;
        Ok(())
    }

    // ===== Lifecycle =====

    /// Bring the backend up. Calling it again while initialized is a no-op.
    pub fn initialize(&self) -> Result<()> {
        self.initialize_with(None)
    }

    /// Bring up `kind` for this run only; the stored configuration keeps its
    /// own `backend`, so a later `initialize` resolves it again.
    ///
    /// While initialized, succeeds only if the running backend is `kind`.
    pub fn initialize_backend(&self, kind: BackendKind) -> Result<()> {
        self.initialize_with(Some(kind))
    }

    fn initialize_with(&self, kind: Option<BackendKind>) -> Result<()> {
        let mut state = self.state.write();
        if let Some(existing) = state.backend.as_ref() {
            let running = existing.driver.backend();
            if let Some(kind) = kind.filter(|&kind| kind != running) {
                return Err(BrokerError::Configuration(format!(
                    "Cannot bring up the {kind} backend; already initialized with {running}"
                )));
            }
            tracing::debug!("GPU broker already initialized ({} backend)", running);
            return Ok(());
        }

        let mut config = self.config.read().clone();
        if kind.is_some() {
            config.backend = kind;
        }
        config.validate()?;

        let driver = D::open(&config)?;
        let devices = driver.enumerate()?;
        let session = self.open_session(devices);

        tracing::info!(
            "GPU broker initialized: {} backend, {} device(s)",
            driver.backend(),
            session.len()
        );

        state.backend = Some(Backend { session, driver });
        Ok(())
    }

    /// Tear down the backend and every live allocation. Safe to call when
    /// never initialized.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut state = self.state.write();
        if state.backend.is_none() {
            tracing::debug!("GPU broker shutdown requested while not initialized");
            return ShutdownReport::default();
        }

        let report = state.sweep();
        state.backend = None;

        tracing::info!(
            "GPU broker shut down: released {} allocation(s), {} bytes",
            report.allocations_released,
            report.bytes_released
        );
        report
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().backend.is_some()
    }

    /// Backend of the running driver.
    pub fn backend(&self) -> Result<BackendKind> {
        self.with_state(|backend, _| Ok(backend.driver.backend()))
    }

    // ===== Device enumeration =====

    /// Query the driver and start a new enumeration session.
    pub fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut state = self.state.write();
        let backend = state.backend.as_mut().ok_or(BrokerError::NotInitialized)?;

        let devices = backend.driver.enumerate()?;
        backend.session = self.open_session(devices.clone());
        tracing::debug!(
            "Enumeration session {}: {} device(s)",
            backend.session.id(),
            devices.len()
        );
        Ok(devices)
    }

    pub fn session_id(&self) -> Result<u64> {
        self.with_state(|backend, _| Ok(backend.session.id()))
    }

    pub fn device(&self, index: usize) -> Result<DeviceDescriptor> {
        self.with_state(|backend, _| backend.session.get(index).cloned())
    }

    pub fn device_name(&self, index: usize) -> Result<String> {
        self.with_state(|backend, _| Ok(backend.session.get(index)?.name.clone()))
    }

    pub fn device_memory(&self, index: usize) -> Result<u64> {
        self.with_state(|backend, _| Ok(backend.session.get(index)?.memory_bytes))
    }

    pub fn compute_units(&self, index: usize) -> Result<u32> {
        self.with_state(|backend, _| Ok(backend.session.get(index)?.compute_units))
    }

    /// Usage of one device as tracked by the broker.
    pub fn memory_info(&self, index: usize) -> Result<MemoryInfo> {
        self.with_state(|backend, allocations| {
            let total_bytes = backend.session.get(index)?.memory_bytes;
            let used_bytes = allocations.used_bytes(index);
            Ok(MemoryInfo {
                total_bytes,
                used_bytes,
                available_bytes: total_bytes.saturating_sub(used_bytes),
                live_allocations: allocations.allocations_on(index),
            })
        })
    }

    // ===== Allocation =====

    pub fn allocate(&self, device_index: usize, size_bytes: u64) -> Result<AllocationHandle> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let backend = state.backend.as_ref().ok_or(BrokerError::NotInitialized)?;

        if size_bytes == 0 {
            return Err(BrokerError::AllocationFailed(
                "size must be greater than zero".into(),
            ));
        }

        let device = backend.session.get(device_index)?;
        let used = state.allocations.used_bytes(device_index);
        let available = device.memory_bytes.saturating_sub(used);
        if size_bytes > available {
            return Err(BrokerError::AllocationFailed(format!(
                "{} bytes requested on {}, {} of {} bytes available",
                size_bytes, device.name, available, device.memory_bytes
            )));
        }

        let native = backend.driver.allocate(device_index, size_bytes)?;
        let handle = state.allocations.insert(device_index, size_bytes, native);

        tracing::debug!("Allocated {} ({} bytes on device {})", handle, size_bytes, device_index);
        Ok(handle)
    }

    pub fn free(&self, handle: AllocationHandle) -> Result<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let backend = state.backend.as_ref().ok_or(BrokerError::NotInitialized)?;

        let record = state.allocations.remove(handle)?;
        backend.driver.free(record.native);

        tracing::debug!("Freed {} ({} bytes)", handle, record.size_bytes);
        Ok(())
    }

    pub fn allocation_info(&self, handle: AllocationHandle) -> Result<AllocationInfo> {
        self.with_state(|_, allocations| Ok(allocations.get(handle)?.info()))
    }

    pub fn live_allocations(&self) -> Result<usize> {
        self.with_state(|_, allocations| Ok(allocations.len()))
    }

    // ===== Transfers =====

    /// Write `data` to the start of the allocation.
    pub fn copy_to_device(&self, handle: AllocationHandle, data: &[u8]) -> Result<()> {
        let state = self.state.write();
        let backend = state.backend()?;

        let record = state.allocations.get(handle)?;
        check_capacity(data.len() as u64, record.size_bytes)?;

        if !data.is_empty() {
            backend.driver.write(&record.native, 0, data)?;
            record.set_state(AllocationState::Written);
        }
        Ok(())
    }

    /// Read `size_bytes` from the start of the allocation.
    pub fn copy_from_device(&self, handle: AllocationHandle, size_bytes: u64) -> Result<Vec<u8>> {
        self.with_state(|backend, allocations| {
            let record = allocations.get(handle)?;
            check_capacity(size_bytes, record.size_bytes)?;

            let mut bytes = host_buffer(size_bytes)?;
            read_into(backend, record, &mut bytes)?;
            Ok(bytes)
        })
    }

    /// Fill `out` from the start of the allocation.
    pub fn copy_from_device_into(&self, handle: AllocationHandle, out: &mut [u8]) -> Result<()> {
        self.with_state(|backend, allocations| {
            let record = allocations.get(handle)?;
            check_capacity(out.len() as u64, record.size_bytes)?;
            read_into(backend, record, out)
        })
    }

    /// Copy `size_bytes` from the start of `src` to the start of `dst`.
    pub fn copy_device_to_device(
        &self,
        src: AllocationHandle,
        dst: AllocationHandle,
        size_bytes: u64,
    ) -> Result<()> {
        let state = self.state.write();
        let backend = state.backend()?;

        let src_record = state.allocations.get(src)?;
        let dst_record = state.allocations.get(dst)?;
        check_capacity(size_bytes, src_record.size_bytes)?;
        check_capacity(size_bytes, dst_record.size_bytes)?;

        if size_bytes == 0 || src == dst {
            return Ok(());
        }
        backend
            .driver
            .copy(&src_record.native, &dst_record.native, size_bytes)?;
        dst_record.set_state(AllocationState::Written);
        Ok(())
    }

    /// Block until the device has finished all submitted work.
    pub fn synchronize(&self, device_index: usize) -> Result<()> {
        self.with_state(|backend, _| {
            backend.session.get(device_index)?;
            backend.driver.synchronize(device_index)
        })
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&Backend<D>, &AllocationTable<D::Allocation>) -> Result<T>,
    ) -> Result<T> {
        let state = self.state.read();
        f(state.backend()?, &state.allocations)
    }

    fn open_session(&self, devices: Vec<DeviceDescriptor>) -> EnumerationSession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        EnumerationSession::new(id, devices)
    }
}

fn read_into<D: GpuDriver>(
    backend: &Backend<D>,
    record: &AllocationRecord<D::Allocation>,
    out: &mut [u8],
) -> Result<()> {
    if out.is_empty() {
        return Ok(());
    }
    backend.driver.read(&record.native, 0, out)?;
    record.set_state(AllocationState::Read);
    Ok(())
}

fn check_capacity(requested: u64, capacity: u64) -> Result<()> {
    if requested > capacity {
        return Err(BrokerError::SizeMismatch {
            requested,
            capacity,
        });
    }
    Ok(())
}
