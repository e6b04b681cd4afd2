// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Allocation handles and the live-allocation table.
//!
//! Handles are generation-checked slot keys. A freed slot that gets reused
//! carries a new generation, so a stale handle never resolves to the new
//! allocation. Across the C ABI a handle travels as its non-zero `u64` form.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use slotmap::{Key, KeyData, SlotMap};

use crate::error::{BrokerError, Result};

slotmap::new_key_type! {
    /// Opaque name of one live device allocation.
    pub struct AllocationHandle;
}

impl AllocationHandle {
    const PREFIX: &'static str = "alloc:";

    /// Token form used across the C ABI. Never zero for a handle produced by
    /// the broker.
    pub fn to_raw(self) -> u64 {
        self.data().as_ffi()
    }

    /// Rebuild a handle from its token. `0` is the failure sentinel and never
    /// names an allocation. Tokens the arena could not have issued (an even
    /// generation) are rejected rather than normalized onto a live slot.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let data = KeyData::from_ffi(raw);
        if raw == 0 || data.as_ffi() != raw {
            return None;
        }
        Some(data.into())
    }
}

impl std::fmt::Display for AllocationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:016x}", Self::PREFIX, self.to_raw())
    }
}

impl FromStr for AllocationHandle {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix(Self::PREFIX)
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .and_then(Self::from_raw)
            .ok_or_else(|| BrokerError::InvalidHandle(s.to_string()))
    }
}

/// Transfer history of a live allocation. Freed is terminal and is modelled
/// by removal from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AllocationState {
    Allocated = 0,
    Written = 1,
    Read = 2,
}

impl AllocationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Written,
            2 => Self::Read,
            _ => Self::Allocated,
        }
    }
}

/// Metadata of a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationInfo {
    pub device_index: usize,
    pub size_bytes: u64,
    pub state: AllocationState,
}

/// Per-device usage as seen by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub live_allocations: usize,
}

/// What `shutdown` reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub allocations_released: usize,
    pub bytes_released: u64,
}

pub(crate) struct AllocationRecord<A> {
    pub(crate) device_index: usize,
    pub(crate) size_bytes: u64,
    state: AtomicU8,
    pub(crate) native: A,
}

impl<A> AllocationRecord<A> {
    pub(crate) fn state(&self) -> AllocationState {
        AllocationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// State changes only need the record, so readers holding a shared lock
    /// can record a read.
    pub(crate) fn set_state(&self, state: AllocationState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn info(&self) -> AllocationInfo {
        AllocationInfo {
            device_index: self.device_index,
            size_bytes: self.size_bytes,
            state: self.state(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceUsage {
    bytes: u64,
    allocations: usize,
}

/// Live allocations plus per-device byte accounting.
pub(crate) struct AllocationTable<A> {
    slots: SlotMap<AllocationHandle, AllocationRecord<A>>,
    usage: HashMap<usize, DeviceUsage>,
}

impl<A> Default for AllocationTable<A> {
    fn default() -> Self {
        Self {
            slots: SlotMap::with_key(),
            usage: HashMap::new(),
        }
    }
}

impl<A> AllocationTable<A> {
    pub(crate) fn insert(&mut self, device_index: usize, size_bytes: u64, native: A) -> AllocationHandle {
        let usage = self.usage.entry(device_index).or_default();
        usage.bytes += size_bytes;
        usage.allocations += 1;

        self.slots.insert(AllocationRecord {
            device_index,
            size_bytes,
            state: AtomicU8::new(AllocationState::Allocated as u8),
            native,
        })
    }

    pub(crate) fn get(&self, handle: AllocationHandle) -> Result<&AllocationRecord<A>> {
        self.slots
            .get(handle)
            .ok_or_else(|| BrokerError::InvalidHandle(handle.to_string()))
    }

    pub(crate) fn remove(&mut self, handle: AllocationHandle) -> Result<AllocationRecord<A>> {
        let record = self
            .slots
            .remove(handle)
            .ok_or_else(|| BrokerError::InvalidHandle(handle.to_string()))?;
        self.release_usage(record.device_index, record.size_bytes);
        Ok(record)
    }

    /// Remove every record, leaving usage at zero.
    pub(crate) fn drain(&mut self) -> Vec<AllocationRecord<A>> {
        self.usage.clear();
        self.slots.drain().map(|(_, record)| record).collect()
    }

    pub(crate) fn used_bytes(&self, device_index: usize) -> u64 {
        self.usage.get(&device_index).map_or(0, |u| u.bytes)
    }

    pub(crate) fn allocations_on(&self, device_index: usize) -> usize {
        self.usage.get(&device_index).map_or(0, |u| u.allocations)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn release_usage(&mut self, device_index: usize, size_bytes: u64) {
        if let Some(usage) = self.usage.get_mut(&device_index) {
            usage.bytes = usage.bytes.saturating_sub(size_bytes);
            usage.allocations = usage.allocations.saturating_sub(1);
            if usage.allocations == 0 {
                self.usage.remove(&device_index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_token_is_nonzero_and_round_trips() {
        let mut table = AllocationTable::<()>::default();
        let handle = table.insert(0, 64, ());

        let raw = handle.to_raw();
        assert_ne!(raw, 0);
        assert_eq!(AllocationHandle::from_raw(raw), Some(handle));
        assert_eq!(AllocationHandle::from_raw(0), None);
    }

    #[test]
    fn test_unissued_token_forms_do_not_resolve() {
        let mut table = AllocationTable::<u32>::default();
        let handle = table.insert(0, 16, 7);
        let raw = handle.to_raw();

        // Same slot index, generation bit cleared.
        let forged = raw ^ (1 << 32);
        assert_eq!(AllocationHandle::from_raw(forged), None);
        assert_eq!(AllocationHandle::from_raw(1), None);
        assert_eq!(AllocationHandle::from_raw(raw & 0xFFFF_FFFF), None);

        assert_eq!(table.get(handle).unwrap().native, 7);
        assert!(format!("alloc:{forged:016x}").parse::<AllocationHandle>().is_err());
    }

    #[test]
    fn test_display_parse() {
        let mut table = AllocationTable::<()>::default();
        let handle = table.insert(0, 64, ());

        let text = handle.to_string();
        assert!(text.starts_with("alloc:"));
        assert_eq!(text.parse::<AllocationHandle>().unwrap(), handle);
        assert!("alloc:zz".parse::<AllocationHandle>().is_err());
        assert!("alloc:0000000000000000".parse::<AllocationHandle>().is_err());
        assert!("1234".parse::<AllocationHandle>().is_err());
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut table = AllocationTable::<u32>::default();
        let first = table.insert(0, 16, 1);
        table.remove(first).unwrap();

        let second = table.insert(0, 16, 2);
        assert_ne!(first.to_raw(), second.to_raw());
        assert!(matches!(table.get(first), Err(BrokerError::InvalidHandle(_))));
        assert_eq!(table.get(second).unwrap().native, 2);
    }

    #[test]
    fn test_usage_accounting() {
        let mut table = AllocationTable::<()>::default();
        let a = table.insert(0, 100, ());
        let _b = table.insert(0, 50, ());
        let _c = table.insert(1, 10, ());

        assert_eq!(table.used_bytes(0), 150);
        assert_eq!(table.allocations_on(0), 2);
        assert_eq!(table.used_bytes(1), 10);

        table.remove(a).unwrap();
        assert_eq!(table.used_bytes(0), 50);
        assert!(table.remove(a).is_err());

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(table.len(), 0);
        assert_eq!(table.used_bytes(0), 0);
        assert_eq!(table.used_bytes(1), 0);
    }

    #[test]
    fn test_state_transitions() {
        let mut table = AllocationTable::<()>::default();
        let handle = table.insert(0, 8, ());
        let record = table.get(handle).unwrap();

        assert_eq!(record.state(), AllocationState::Allocated);
        record.set_state(AllocationState::Written);
        assert_eq!(record.info().state, AllocationState::Written);
        record.set_state(AllocationState::Read);
        assert_eq!(record.state(), AllocationState::Read);
    }
}
