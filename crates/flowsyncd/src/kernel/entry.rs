//! Per-flow kernel shadow entries.

use super::wire::SyncView;
use crate::flow::{DropReason, FlowAction, FlowRecord};
use flow_types::FlowKey;

/// Lifecycle of a kernel shadow entry.
///
/// ```text
/// Unresolved ──> AddPending ──> Encoded ──> Acknowledged
///      ▲              │            │  ▲          │
///      │              │            ▼  │          ▼
///      └───────── ChangePending <─────┘      (changes loop
///                                             back through
///                                             ChangePending)
/// ```
///
/// `Deleted` is reachable from every state. A delete of an entry that
/// never obtained a kernel index is dropped on the spot, nothing is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// A dependency is missing; the entry is parked until re-evaluated.
    Unresolved,
    /// First encode not attempted yet.
    AddPending,
    /// Encoded before, and a change is staged.
    ChangePending,
    /// Descriptor written to the kernel, acknowledgment outstanding.
    Encoded,
    /// Kernel confirmed the last write.
    Acknowledged,
    /// Delete encoded; the entry lingers until the delete is acknowledged.
    Deleted,
}

/// A dependency the entry needs resolved before encoding.
///
/// Ordering is significant: nexthops are surfaced before mirror
/// destinations, and only one unresolved dependency is reported at a time
/// so resolution stays deterministic and bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyRef {
    Nexthop(String),
    Mirror(String),
}

impl DependencyRef {
    pub fn name(&self) -> &str {
        match self {
            DependencyRef::Nexthop(name) | DependencyRef::Mirror(name) => name,
        }
    }
}

/// Resolution callback the scheduler provides when evaluating
/// dependencies.
pub trait DependencyProbe {
    fn nexthop_resolved(&self, name: &str) -> bool;
    fn mirror_resolved(&self, name: &str) -> bool;
}

/// Shadow state machine staging one flow record for the kernel table.
///
/// Keeps a snapshot of every externally relevant field so a no-op `sync`
/// is detected instead of re-encoded.
#[derive(Debug, Clone)]
pub struct KernelSyncEntry {
    pub flow_key: FlowKey,
    pub state: SyncState,
    pub index: Option<u32>,
    /// Encoded delete descriptor kept for retry when the kernel write
    /// failed; the owning record is gone by then.
    pub pending_delete: Option<Vec<u8>>,
    deps: Vec<DependencyRef>,

    old_reverse_index: Option<u32>,
    old_action: FlowAction,
    old_drop_reason: DropReason,
    old_component_idx: Option<u16>,
    old_mirror_indices: [Option<u16>; 2],
    old_trap: bool,
    old_ecmp: bool,
    old_src_nexthop_id: u32,
}

impl KernelSyncEntry {
    pub fn new(record: &FlowRecord) -> Self {
        let mut entry = Self {
            flow_key: record.key,
            state: SyncState::AddPending,
            index: None,
            pending_delete: None,
            deps: Vec::new(),
            old_reverse_index: None,
            old_action: FlowAction::Forward,
            old_drop_reason: DropReason::None,
            old_component_idx: None,
            old_mirror_indices: [None, None],
            old_trap: false,
            old_ecmp: false,
            old_src_nexthop_id: 0,
        };
        entry.rebuild_deps(record);
        entry
    }

    /// Recomputes the dependency list from the record, nexthop first.
    pub fn rebuild_deps(&mut self, record: &FlowRecord) {
        self.deps.clear();
        if let Some(nh) = &record.rpf_nexthop {
            self.deps.push(DependencyRef::Nexthop(nh.clone()));
        }
        for analyzer in record.mirror_analyzers.iter().take(2) {
            self.deps.push(DependencyRef::Mirror(analyzer.clone()));
        }
    }

    pub fn deps(&self) -> &[DependencyRef] {
        &self.deps
    }

    /// Returns the first dependency that is not yet resolved, or `None`
    /// once the entry may encode.
    pub fn unresolved_reference(&self, probe: &dyn DependencyProbe) -> Option<&DependencyRef> {
        self.deps.iter().find(|dep| match dep {
            DependencyRef::Nexthop(name) => !probe.nexthop_resolved(name),
            DependencyRef::Mirror(name) => !probe.mirror_resolved(name),
        })
    }

    /// Compares the cached snapshot against current values, updating the
    /// snapshot. Returns whether anything externally relevant changed.
    ///
    /// Idempotent: a second call with no intervening mutation returns
    /// false.
    pub fn sync(&mut self, record: &FlowRecord, view: &SyncView) -> bool {
        let mut changed = false;

        if let Some(reverse_index) = view.reverse_index {
            if self.old_reverse_index != Some(reverse_index) {
                // The very first index assignment is not a change to an
                // encoded value, only a loss or move of a known index is.
                if self.old_reverse_index.is_some() {
                    changed = true;
                }
                self.old_reverse_index = Some(reverse_index);
            }
        }

        if self.old_action != record.action {
            self.old_action = record.action;
            changed = true;
        }
        if self.old_drop_reason != record.drop_reason {
            self.old_drop_reason = record.drop_reason;
            changed = true;
        }
        if self.old_component_idx != record.component_idx {
            self.old_component_idx = record.component_idx;
            changed = true;
        }
        if self.old_mirror_indices != view.mirror_indices {
            self.old_mirror_indices = view.mirror_indices;
            changed = true;
        }
        if self.old_trap != record.is_trapped() {
            self.old_trap = record.is_trapped();
            changed = true;
        }
        if self.old_ecmp != record.is_ecmp() {
            self.old_ecmp = record.is_ecmp();
            changed = true;
        }
        if self.old_src_nexthop_id != view.src_nexthop_id {
            self.old_src_nexthop_id = view.src_nexthop_id;
            changed = true;
        }

        changed
    }

    /// True once the entry has something staged for the kernel.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            SyncState::Unresolved | SyncState::AddPending | SyncState::ChangePending
        )
    }

    pub fn ever_encoded(&self) -> bool {
        self.index.is_some()
    }
}
