//! Byte-exact kernel flow descriptor layout.
//!
//! Every multi-byte field is big-endian. The fixed header is followed by a
//! NAT sub-block when the VRF-translate flag is set, and a mirror sub-block
//! (analyzer indices, mirror source, TLV metadata) when the mirror flag is
//! set. A delete carries the header only, with the flag set cleared.

use crate::flow::{FlowAction, FlowRecord};
use flow_types::Ipv4Address;

pub const OP_ADD: u8 = 1;
pub const OP_CHANGE: u8 = 2;
pub const OP_DELETE: u8 = 3;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 65;

/// Sentinel for "no multipath component".
pub const NO_COMPONENT: u16 = u16::MAX;
/// Sentinel for "no reverse index".
pub const NO_INDEX: u32 = u32::MAX;
/// Sentinel for "analyzer slot unused".
pub const NO_MIRROR: u16 = u16::MAX;

/// Flag bitmap of the kernel entry.
pub mod flags {
    pub const ACTIVE: u16 = 1 << 0;
    pub const MIRROR: u16 = 1 << 1;
    pub const SNAT: u16 = 1 << 2;
    pub const DNAT: u16 = 1 << 3;
    pub const SPAT: u16 = 1 << 4;
    pub const DPAT: u16 = 1 << 5;
    pub const VRF_TRANSLATE: u16 = 1 << 6;
    pub const REVERSE_VALID: u16 = 1 << 7;
    pub const TRAP: u16 = 1 << 8;
}

/// Mirror metadata TLV tags.
pub mod tlv {
    pub const END: u8 = 0;
    pub const CAPTURE_HOST: u8 = 1;
    pub const FLAGS: u8 = 2;
    pub const SOURCE_NETWORK: u8 = 3;
    pub const DEST_NETWORK: u8 = 4;
}

/// Ingress marker inside the mirror flags TLV word.
const MIRROR_INGRESS_BIT: u32 = 1 << 30;

/// Operation requested from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Add,
    Change,
    Delete,
}

impl SyncOp {
    pub fn op_code(&self) -> u8 {
        match self {
            SyncOp::Add => OP_ADD,
            SyncOp::Change => OP_CHANGE,
            SyncOp::Delete => OP_DELETE,
        }
    }
}

/// Resolved identities a descriptor needs beyond the flow record itself.
#[derive(Debug, Clone, Default)]
pub struct SyncView {
    /// Kernel index of the bonded reverse flow, once it has one.
    pub reverse_index: Option<u32>,
    /// Resolved analyzer indices, first and second mirror destination.
    pub mirror_indices: [Option<u16>; 2],
    /// Resolved RPF source nexthop; 0 means "discard, skip the check".
    pub src_nexthop_id: u32,
    /// This router's address, embedded as the mirror capture host.
    pub capture_host: Ipv4Address,
    /// UDP source port used for mirrored packets.
    pub mirror_port: u16,
}

fn wire_flags(record: &FlowRecord) -> u16 {
    let mut bits = flags::ACTIVE;

    if !record.mirror_analyzers.is_empty() {
        bits |= flags::MIRROR;
    }
    if record.is_trapped() {
        bits |= flags::TRAP;
    }
    if let Some(rev_key) = &record.reverse_key {
        bits |= flags::REVERSE_VALID;
        if record.is_nat() {
            // Translation is inferred by comparing the two keys: whatever
            // differs between the forward tuple and the mirrored side of
            // the reverse tuple is being rewritten.
            if record.key.src_addr != rev_key.dst_addr {
                bits |= flags::SNAT;
            }
            if record.key.dst_addr != rev_key.src_addr {
                bits |= flags::DNAT;
            }
            if record.key.has_ports() {
                if record.key.src_port != rev_key.dst_port {
                    bits |= flags::SPAT;
                }
                if record.key.dst_port != rev_key.src_port {
                    bits |= flags::DPAT;
                }
            }
        }
    }
    if record.vrf_translate() {
        bits |= flags::VRF_TRANSLATE;
    }
    bits
}

fn effective_action(record: &FlowRecord) -> FlowAction {
    if record.is_trapped() {
        return FlowAction::Hold;
    }
    if record.action == FlowAction::Nat && record.reverse_key.is_none() {
        // A NAT entry without its partner would translate into nowhere.
        return FlowAction::Drop;
    }
    record.action
}

fn put_tlv(buf: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    let len = payload.len().min(u8::MAX as usize);
    buf.push(tag);
    buf.push(len as u8);
    buf.extend_from_slice(&payload[..len]);
}

fn put_mirror_metadata(buf: &mut Vec<u8>, record: &FlowRecord, view: &SyncView) {
    let mut action_word = record.action.wire_code() as u32;
    if record.is_ingress() {
        action_word |= MIRROR_INGRESS_BIT;
    }
    put_tlv(buf, tlv::CAPTURE_HOST, &view.capture_host.octets());
    put_tlv(buf, tlv::FLAGS, &action_word.to_be_bytes());
    put_tlv(buf, tlv::SOURCE_NETWORK, record.source_network.as_bytes());
    put_tlv(buf, tlv::DEST_NETWORK, record.dest_network.as_bytes());
    put_tlv(buf, tlv::END, &[]);
}

/// Builds the wire descriptor for `record` into `buf`.
///
/// Returns the encoded length. A zero return means the message is
/// suppressed and nothing must be sent:
///
/// - delete of a flow that never obtained a kernel index, and
/// - add/change of a NAT or ECMP flow whose bonded reverse flow has no
///   kernel index yet. Writing such an entry before its partner exists
///   risks a forwarding loop or misroute, so the entry stays dirty and is
///   retried once the partner lands.
pub fn encode_descriptor(
    op: SyncOp,
    index: Option<u32>,
    record: &FlowRecord,
    view: &SyncView,
    buf: &mut Vec<u8>,
) -> usize {
    buf.clear();

    let index = match index {
        Some(index) => index,
        None => return 0,
    };

    if op != SyncOp::Delete
        && (record.is_nat() || record.is_ecmp())
        && record.reverse_key.is_some()
        && view.reverse_index.is_none()
    {
        return 0;
    }

    let (bits, action, drop_reason) = if op == SyncOp::Delete {
        (0u16, 0u8, 0u8)
    } else {
        (
            wire_flags(record),
            effective_action(record).wire_code(),
            record.drop_reason.wire_code(),
        )
    };

    buf.push(op.op_code());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&bits.to_be_bytes());
    buf.push(action);
    buf.push(drop_reason);
    buf.push(record.key.protocol);
    buf.push(if record.key.src_addr.is_ipv4() { 4 } else { 6 });
    buf.extend_from_slice(&record.key.src_addr.to_wire_octets());
    buf.extend_from_slice(&record.key.dst_addr.to_wire_octets());
    buf.extend_from_slice(&record.key.src_port.to_be_bytes());
    buf.extend_from_slice(&record.key.dst_port.to_be_bytes());
    buf.extend_from_slice(&record.key.nexthop_id.to_be_bytes());
    buf.extend_from_slice(&record.vrf.to_be_bytes());
    buf.extend_from_slice(&view.src_nexthop_id.to_be_bytes());
    buf.extend_from_slice(&record.component_idx.unwrap_or(NO_COMPONENT).to_be_bytes());
    buf.extend_from_slice(&view.reverse_index.unwrap_or(NO_INDEX).to_be_bytes());

    debug_assert_eq!(buf.len(), HEADER_LEN);

    if op == SyncOp::Delete {
        return buf.len();
    }

    if bits & flags::VRF_TRANSLATE != 0 {
        buf.extend_from_slice(&record.dest_vrf.to_be_bytes());
    }

    if bits & flags::MIRROR != 0 {
        buf.extend_from_slice(&view.mirror_indices[0].unwrap_or(NO_MIRROR).to_be_bytes());
        buf.extend_from_slice(&view.mirror_indices[1].unwrap_or(NO_MIRROR).to_be_bytes());
        buf.extend_from_slice(&view.capture_host.octets());
        buf.extend_from_slice(&view.mirror_port.to_be_bytes());
        put_mirror_metadata(buf, record, view);
    }

    buf.len()
}
