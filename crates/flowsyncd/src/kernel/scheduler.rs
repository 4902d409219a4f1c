//! Dependency-ordered staging of flows into the kernel table.

use super::entry::{DependencyProbe, KernelSyncEntry, SyncState};
use super::index::IndexAllocator;
use super::table::KernelFlowTable;
use super::wire::{self, SyncOp, SyncView};
use crate::flow::{FlowRecord, FlowTable};
use crate::shadow::ShadowRegistry;
use flow_types::{FlowKey, Ipv4Address};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Counters exposed by the scheduler.
///
/// `dependency_waits` growing without `encoded` moving is the signature of
/// a stuck dependency; the current depth is available via
/// [`SyncScheduler::unresolved_depth`].
#[derive(Debug, Clone, Default)]
pub struct SyncSchedulerStats {
    pub staged: u64,
    pub encoded: u64,
    pub no_change: u64,
    pub suppressed: u64,
    pub acked: u64,
    pub deletes_dropped: u64,
    pub write_failures: u64,
    pub dependency_waits: u64,
}

struct ShadowProbe<'a> {
    nexthops: &'a ShadowRegistry,
    mirrors: &'a ShadowRegistry,
}

impl DependencyProbe for ShadowProbe<'_> {
    fn nexthop_resolved(&self, name: &str) -> bool {
        self.nexthops.is_resolved(name)
    }

    fn mirror_resolved(&self, name: &str) -> bool {
        self.mirrors.is_resolved(name)
    }
}

/// Schedules kernel mirroring for the flow table.
///
/// Writes are fire-and-forget: a failed or suppressed encode leaves the
/// entry dirty and it is retried on the next pass. Nothing here blocks on
/// kernel I/O or acknowledgments.
pub struct SyncScheduler {
    entries: HashMap<FlowKey, KernelSyncEntry>,
    queue: VecDeque<FlowKey>,
    queued: HashSet<FlowKey>,
    allocator: IndexAllocator,
    kernel: Arc<dyn KernelFlowTable>,
    capture_host: Ipv4Address,
    mirror_port: u16,
    buf: Vec<u8>,
    stats: SyncSchedulerStats,
}

impl SyncScheduler {
    pub fn new(
        kernel: Arc<dyn KernelFlowTable>,
        table_capacity: u32,
        capture_host: Ipv4Address,
        mirror_port: u16,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            queue: VecDeque::new(),
            queued: HashSet::new(),
            allocator: IndexAllocator::new(table_capacity),
            kernel,
            capture_host,
            mirror_port,
            buf: Vec::new(),
            stats: SyncSchedulerStats::default(),
        }
    }

    pub fn stats(&self) -> &SyncSchedulerStats {
        &self.stats
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn dirty_depth(&self) -> usize {
        self.queue.len()
    }

    /// Number of entries parked on an unresolved dependency.
    pub fn unresolved_depth(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == SyncState::Unresolved)
            .count()
    }

    pub fn state_of(&self, key: &FlowKey) -> Option<SyncState> {
        self.entries.get(key).map(|e| e.state)
    }

    pub fn kernel_index(&self, key: &FlowKey) -> Option<u32> {
        self.entries.get(key).and_then(|e| e.index)
    }

    fn enqueue(&mut self, key: FlowKey) {
        if self.queued.insert(key) {
            self.queue.push_back(key);
        }
    }

    /// Stages a flow for add or change.
    pub fn stage(&mut self, record: &FlowRecord) {
        if let Some(existing) = self.entries.get(&record.key) {
            if existing.state == SyncState::Deleted {
                if existing.pending_delete.is_some() {
                    // The previous incarnation's delete has not reached the
                    // kernel yet; the re-created flow must wait for it.
                    warn!(flow = %record.key, "flow re-created while delete still pending");
                    return;
                }
                self.entries.remove(&record.key);
            }
        }
        let entry = self
            .entries
            .entry(record.key)
            .or_insert_with(|| KernelSyncEntry::new(record));
        entry.rebuild_deps(record);
        if entry.ever_encoded() {
            entry.state = SyncState::ChangePending;
        } else if entry.state != SyncState::Unresolved {
            entry.state = SyncState::AddPending;
        }
        self.stats.staged += 1;
        self.enqueue(record.key);
    }

    /// Stages a flow delete. Must run while the record still exists; the
    /// descriptor is built here so a failed write can be retried after the
    /// record is gone.
    ///
    /// Cancels anything outstanding regardless of the entry's state. A
    /// flow that never obtained a kernel index is dropped on the spot.
    pub fn stage_delete(&mut self, record: &FlowRecord) {
        self.queued.remove(&record.key);
        let Some(entry) = self.entries.get_mut(&record.key) else {
            return;
        };
        if !entry.ever_encoded() {
            debug!(flow = %record.key, "delete of never-encoded flow dropped");
            self.entries.remove(&record.key);
            self.stats.deletes_dropped += 1;
            return;
        }

        let view = SyncView::default();
        let len = wire::encode_descriptor(SyncOp::Delete, entry.index, record, &view, &mut self.buf);
        entry.state = SyncState::Deleted;
        if len == 0 {
            // Unreachable for an encoded entry; treat as dropped.
            self.entries.remove(&record.key);
            self.stats.deletes_dropped += 1;
            return;
        }
        match self.kernel.write(&self.buf) {
            Ok(()) => {
                let index = entry.index.unwrap_or_default();
                entry.pending_delete = None;
                self.allocator.retire(index);
                self.stats.encoded += 1;
            }
            Err(err) => {
                warn!(flow = %record.key, %err, "kernel delete failed, will retry");
                entry.pending_delete = Some(self.buf.clone());
                self.stats.write_failures += 1;
                self.enqueue(record.key);
            }
        }
    }

    fn retry_delete(&mut self, key: &FlowKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        let Some(descriptor) = entry.pending_delete.clone() else {
            return;
        };
        match self.kernel.write(&descriptor) {
            Ok(()) => {
                let index = entry.index.unwrap_or_default();
                entry.pending_delete = None;
                self.allocator.retire(index);
                self.stats.encoded += 1;
            }
            Err(err) => {
                warn!(flow = %key, %err, "kernel delete retry failed");
                self.stats.write_failures += 1;
                self.enqueue(*key);
            }
        }
    }

    /// Records the kernel's acknowledgment for a flow.
    ///
    /// An acknowledged delete releases the kernel index for reuse and
    /// drops the shadow entry.
    pub fn acknowledge(&mut self, key: &FlowKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        match entry.state {
            SyncState::Encoded => {
                entry.state = SyncState::Acknowledged;
                self.stats.acked += 1;
            }
            SyncState::Deleted if entry.pending_delete.is_none() => {
                if let Some(index) = entry.index {
                    self.allocator.release(index);
                }
                self.entries.remove(key);
                self.stats.acked += 1;
            }
            _ => {}
        }
    }

    fn build_view(&self, record: &FlowRecord, nexthops: &ShadowRegistry, mirrors: &ShadowRegistry) -> SyncView {
        let reverse_index = record
            .reverse_key
            .as_ref()
            .and_then(|rk| self.entries.get(rk))
            .and_then(|e| e.index);
        let mut mirror_indices = [None, None];
        for (slot, analyzer) in record.mirror_analyzers.iter().take(2).enumerate() {
            mirror_indices[slot] = mirrors.index_of(analyzer).map(|i| i as u16);
        }
        let src_nexthop_id = record
            .rpf_nexthop
            .as_ref()
            .and_then(|nh| nexthops.index_of(nh))
            .unwrap_or(0);
        SyncView {
            reverse_index,
            mirror_indices,
            src_nexthop_id,
            capture_host: self.capture_host,
            mirror_port: self.mirror_port,
        }
    }

    /// Processes up to `limit` queued entries.
    ///
    /// Returns the kernel indices assigned during this pass so the caller
    /// can mirror them back onto the flow records.
    pub fn run_pass(
        &mut self,
        table: &FlowTable,
        nexthops: &ShadowRegistry,
        mirrors: &ShadowRegistry,
        limit: usize,
    ) -> Vec<(FlowKey, u32)> {
        let mut assigned = Vec::new();

        for _ in 0..limit {
            let Some(key) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&key);

            if self
                .entries
                .get(&key)
                .is_some_and(|e| e.state == SyncState::Deleted)
            {
                self.retry_delete(&key);
                continue;
            }

            let Some(record) = table.get(&key) else {
                // Record vanished without a staged delete; nothing was
                // encoded for it or the delete already went out.
                self.entries.remove(&key);
                continue;
            };

            let probe = ShadowProbe { nexthops, mirrors };
            let waiting = self
                .entries
                .get(&key)
                .and_then(|e| e.unresolved_reference(&probe).map(|d| d.name().to_string()));
            if let Some(dependency) = waiting {
                let entry = self.entries.get_mut(&key).expect("entry exists");
                entry.state = SyncState::Unresolved;
                self.stats.dependency_waits += 1;
                debug!(flow = %key, dependency, "sync entry waiting for dependency");
                self.enqueue(key);
                continue;
            }

            let view = self.build_view(record, nexthops, mirrors);
            let entry = self.entries.get_mut(&key).expect("entry exists");
            if entry.state == SyncState::Unresolved {
                entry.state = if entry.ever_encoded() {
                    SyncState::ChangePending
                } else {
                    SyncState::AddPending
                };
            }

            let changed = entry.sync(record, &view);
            if entry.state == SyncState::ChangePending && !changed {
                entry.state = SyncState::Encoded;
                self.stats.no_change += 1;
                continue;
            }

            let op = if entry.state == SyncState::AddPending {
                SyncOp::Add
            } else {
                SyncOp::Change
            };
            if entry.index.is_none() {
                match self.allocator.allocate() {
                    Some(index) => {
                        entry.index = Some(index);
                        assigned.push((key, index));
                    }
                    None => {
                        error!(flow = %key, "kernel flow table exhausted");
                        self.stats.write_failures += 1;
                        self.enqueue(key);
                        continue;
                    }
                }
            }

            let len = wire::encode_descriptor(op, entry.index, record, &view, &mut self.buf);
            if len == 0 {
                // NAT/ECMP partner has no index yet; stay dirty and retry
                // after the partner's pass.
                self.stats.suppressed += 1;
                self.enqueue(key);
                continue;
            }

            match self.kernel.write(&self.buf) {
                Ok(()) => {
                    entry.state = SyncState::Encoded;
                    self.stats.encoded += 1;
                }
                Err(err) => {
                    error!(flow = %key, index = ?entry.index, op = ?op, %err,
                           "kernel flow write failed");
                    self.stats.write_failures += 1;
                    self.enqueue(key);
                }
            }
        }

        assigned
    }
}
