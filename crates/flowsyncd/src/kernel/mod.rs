//! Kernel flow-table mirroring: wire format, sync entries, scheduling.

mod entry;
mod index;
mod scheduler;
mod table;
pub mod wire;

pub use entry::{DependencyProbe, DependencyRef, KernelSyncEntry, SyncState};
pub use index::IndexAllocator;
pub use scheduler::{SyncScheduler, SyncSchedulerStats};
pub use table::{
    tcp_flags, InProcessFlowTable, KernelCounterBank, KernelFlowSnapshot, KernelFlowTable,
    KernelWriteError,
};
pub use wire::{SyncOp, SyncView};
