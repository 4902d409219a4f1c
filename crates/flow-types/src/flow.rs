//! Flow identity and per-flow attribute flags.

use crate::IpAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// TCP protocol number.
pub const IPPROTO_TCP: u8 = 6;
/// UDP protocol number.
pub const IPPROTO_UDP: u8 = 17;
/// ICMP protocol number.
pub const IPPROTO_ICMP: u8 = 1;

/// Identity of one forwarding flow.
///
/// The ingress nexthop id is part of the key: the same 5-tuple arriving
/// over two different nexthops is two different flows.
///
/// Ordered (nexthop id first) so the flow registry can be scanned with a
/// resumable cursor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FlowKey {
    pub nexthop_id: u32,
    pub src_addr: IpAddress,
    pub dst_addr: IpAddress,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(
        nexthop_id: u32,
        src_addr: IpAddress,
        dst_addr: IpAddress,
        protocol: u8,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        Self {
            nexthop_id,
            src_addr,
            dst_addr,
            protocol,
            src_port,
            dst_port,
        }
    }

    /// Returns true if the protocol carries ports that can be translated.
    pub fn has_ports(&self) -> bool {
        self.protocol == IPPROTO_TCP || self.protocol == IPPROTO_UDP
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nh {} {} {}:{} -> {}:{}",
            self.nexthop_id, self.protocol, self.src_addr, self.src_port, self.dst_addr,
            self.dst_port
        )
    }
}

/// Per-flow attribute bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowFlags(u16);

impl FlowFlags {
    /// Address or port translation applies to this flow.
    pub const NAT: FlowFlags = FlowFlags(1 << 0);
    /// Flow is a member of a multipath (ECMP) group.
    pub const ECMP: FlowFlags = FlowFlags(1 << 1);
    /// Flow was created in a degraded state and must be aged immediately.
    pub const SHORT: FlowFlags = FlowFlags(1 << 2);
    /// Packets of this flow are trapped to the agent.
    pub const TRAP: FlowFlags = FlowFlags(1 << 3);
    /// Both endpoints are co-resident on this router.
    pub const LOCAL: FlowFlags = FlowFlags(1 << 4);
    /// Flow was observed in the ingress direction.
    pub const INGRESS: FlowFlags = FlowFlags(1 << 5);

    pub const fn empty() -> Self {
        FlowFlags(0)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: FlowFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: FlowFlags) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: FlowFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for FlowFlags {
    type Output = FlowFlags;

    fn bitor(self, rhs: FlowFlags) -> FlowFlags {
        FlowFlags(self.0 | rhs.0)
    }
}
