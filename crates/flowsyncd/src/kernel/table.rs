//! Kernel flow-table access traits and the in-process implementation.

use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// TCP state bits reported by the kernel per flow entry.
pub mod tcp_flags {
    pub const SYN: u16 = 1 << 0;
    pub const SYN_R: u16 = 1 << 1;
    pub const ESTABLISHED: u16 = 1 << 2;
    pub const ESTABLISHED_R: u16 = 1 << 3;
    pub const HALF_CLOSE: u16 = 1 << 4;
    pub const RST: u16 = 1 << 5;
}

/// Raw per-index counters as the kernel keeps them: a narrow wrapping
/// counter plus a narrower overflow segment maintained by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCounterBank {
    pub bytes: u32,
    pub bytes_oflow: u16,
    pub packets: u32,
    pub packets_oflow: u16,
}

impl KernelCounterBank {
    /// Merges the overflow segment with the base counter.
    pub fn merged_bytes(&self) -> u64 {
        (self.bytes_oflow as u64) << 32 | self.bytes as u64
    }

    pub fn merged_packets(&self) -> u64 {
        (self.packets_oflow as u64) << 32 | self.packets as u64
    }
}

/// Read-back view of one kernel flow entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelFlowSnapshot {
    pub counters: KernelCounterBank,
    pub tcp_flags: u16,
}

/// Failure modes of a kernel table write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelWriteError {
    #[error("flow table bucket full")]
    TableFull,

    #[error("flow generation mismatch")]
    GenerationMismatch,

    #[error("bad descriptor: {0}")]
    BadDescriptor(String),
}

/// The kernel-resident flow table.
///
/// Writes are fire-and-forget from the caller's point of view: a failed
/// write is reported, logged and retried on the next sync pass, never
/// blocked on. Reads are keyed by the kernel-visible index; an absent or
/// inactive index returns `None`.
pub trait KernelFlowTable: Send + Sync {
    fn write(&self, descriptor: &[u8]) -> Result<(), KernelWriteError>;

    fn read(&self, index: u32) -> Option<KernelFlowSnapshot>;
}

/// In-process stand-in for the kernel table.
///
/// Used by unit tests and by the daemon when no kernel device is
/// configured. Applies descriptors to a slot map and lets tests drive
/// counters to simulate traffic.
#[derive(Debug, Default)]
pub struct InProcessFlowTable {
    slots: Mutex<HashMap<u32, KernelFlowSnapshot>>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_next: Mutex<Option<KernelWriteError>>,
}

impl InProcessFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot write failure.
    pub fn fail_next_write(&self, err: KernelWriteError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// Sets the counters for an index, creating the slot if needed.
    pub fn set_counters(&self, index: u32, counters: KernelCounterBank) {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(index).or_default().counters = counters;
    }

    pub fn set_tcp_flags(&self, index: u32, flags: u16) {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(index).or_default().tcp_flags = flags;
    }

    /// Returns every raw descriptor written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl KernelFlowTable for InProcessFlowTable {
    fn write(&self, descriptor: &[u8]) -> Result<(), KernelWriteError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        if descriptor.len() < super::wire::HEADER_LEN {
            return Err(KernelWriteError::BadDescriptor(format!(
                "descriptor too short: {} bytes",
                descriptor.len()
            )));
        }
        let op = descriptor[0];
        let index = BigEndian::read_u32(&descriptor[1..5]);
        let mut slots = self.slots.lock().unwrap();
        match op {
            super::wire::OP_DELETE => {
                slots.remove(&index);
            }
            super::wire::OP_ADD | super::wire::OP_CHANGE => {
                slots.entry(index).or_default();
            }
            other => {
                return Err(KernelWriteError::BadDescriptor(format!(
                    "unknown op {other}"
                )));
            }
        }
        drop(slots);
        self.writes.lock().unwrap().push(descriptor.to_vec());
        Ok(())
    }

    fn read(&self, index: u32) -> Option<KernelFlowSnapshot> {
        self.slots.lock().unwrap().get(&index).copied()
    }
}
