//! Flow record types.

use flow_types::{FlowFlags, FlowKey, VrfId};
use uuid::Uuid;

/// Forwarding decision for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowAction {
    #[default]
    Forward,
    Drop,
    Nat,
    /// Packets held in the kernel and trapped to the agent.
    Hold,
}

impl FlowAction {
    pub fn wire_code(&self) -> u8 {
        match self {
            FlowAction::Forward => 1,
            FlowAction::Drop => 2,
            FlowAction::Nat => 3,
            FlowAction::Hold => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowAction::Forward => "forward",
            FlowAction::Drop => "drop",
            FlowAction::Nat => "nat",
            FlowAction::Hold => "hold",
        }
    }
}

/// Why a flow was dropped or created short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropReason {
    #[default]
    None,
    Policy,
    OutPolicy,
    NoSourceRoute,
    NoDestRoute,
    NoReverseFlow,
    ReverseFlowChange,
    NatChange,
    FlowLimit,
    UnavailableInterface,
    UnavailableVrf,
}

impl DropReason {
    pub fn wire_code(&self) -> u8 {
        match self {
            DropReason::None => 0,
            DropReason::Policy => 1,
            DropReason::OutPolicy => 2,
            DropReason::NoSourceRoute => 3,
            DropReason::NoDestRoute => 4,
            DropReason::NoReverseFlow => 5,
            DropReason::ReverseFlowChange => 6,
            DropReason::NatChange => 7,
            DropReason::FlowLimit => 8,
            DropReason::UnavailableInterface => 9,
            DropReason::UnavailableVrf => 10,
        }
    }
}

/// In-memory representation of one forwarding flow.
///
/// Owned exclusively by [`super::FlowTable`]; the sync layer and the
/// collector refer to it by key and re-resolve on every access, so a
/// concurrent delete can never leave a dangling reference.
///
/// Byte and packet counters are the 64-bit reconstructed values; the low
/// 48 (bytes) / 40 (packets) bits mirror the kernel counter, the high bits
/// accumulate detected wraps.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub vrf: VrfId,
    /// Translation target VRF; equals `vrf` when no translation applies.
    pub dest_vrf: VrfId,
    pub flags: FlowFlags,
    pub action: FlowAction,
    pub drop_reason: DropReason,

    pub bytes: u64,
    pub packets: u64,
    pub setup_time_us: u64,
    pub last_modified_us: u64,
    /// 0 until teardown is detected.
    pub teardown_time_us: u64,
    /// Last TCP flag word observed in the kernel entry.
    pub tcp_flags: u16,
    /// True once a telemetry record carrying the setup time went out.
    pub exported: bool,

    /// Bonded reverse flow, if any. Non-owning: resolved by key lookup.
    pub reverse_key: Option<FlowKey>,
    pub correlation_id: Uuid,
    /// Separate correlation id for the egress leg of a local flow.
    pub egress_correlation_id: Uuid,

    /// Member slot inside the flow's multipath group, when ECMP.
    pub component_idx: Option<u16>,
    /// Analyzer destinations; at most two are mirrored to the kernel.
    pub mirror_analyzers: Vec<String>,
    /// Reverse-path-forwarding source nexthop, resolved via the shadow
    /// registry before encode.
    pub rpf_nexthop: Option<String>,

    pub source_network: String,
    pub dest_network: String,

    /// Kernel-visible index, mirrored back from the sync layer once the
    /// first encode succeeded.
    pub kernel_index: Option<u32>,
}

impl FlowRecord {
    pub fn new(key: FlowKey, vrf: VrfId, now_us: u64) -> Self {
        Self {
            key,
            vrf,
            dest_vrf: vrf,
            flags: FlowFlags::empty(),
            action: FlowAction::Forward,
            drop_reason: DropReason::None,
            bytes: 0,
            packets: 0,
            setup_time_us: now_us,
            last_modified_us: now_us,
            teardown_time_us: 0,
            tcp_flags: 0,
            exported: false,
            reverse_key: None,
            correlation_id: Uuid::new_v4(),
            egress_correlation_id: Uuid::new_v4(),
            component_idx: None,
            mirror_analyzers: Vec::new(),
            rpf_nexthop: None,
            source_network: String::new(),
            dest_network: String::new(),
            kernel_index: None,
        }
    }

    pub fn is_nat(&self) -> bool {
        self.flags.contains(FlowFlags::NAT)
    }

    pub fn is_ecmp(&self) -> bool {
        self.flags.contains(FlowFlags::ECMP)
    }

    pub fn is_short(&self) -> bool {
        self.flags.contains(FlowFlags::SHORT)
    }

    pub fn is_trapped(&self) -> bool {
        self.flags.contains(FlowFlags::TRAP)
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(FlowFlags::LOCAL)
    }

    pub fn is_ingress(&self) -> bool {
        self.flags.contains(FlowFlags::INGRESS)
    }

    /// True when the kernel entry must carry a VRF-translate target.
    pub fn vrf_translate(&self) -> bool {
        self.is_nat() || self.dest_vrf != self.vrf
    }
}
