//! Common types for the flowsync virtual-router agent.
//!
//! This crate provides type-safe representations of the primitives shared
//! by the flow table, the multipath composer and the kernel sync layer:
//!
//! - [`IpAddress`]: IPv4 and IPv6 addresses
//! - [`FlowKey`]: the 5-tuple + ingress-nexthop identity of a flow
//! - [`FlowFlags`]: per-flow attribute bitmap
//! - [`Label`]: forwarding labels assigned to paths and multipath groups

mod flow;
mod ip;
mod label;

pub use flow::{FlowFlags, FlowKey, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
pub use ip::{IpAddress, Ipv4Address, Ipv6Address};
pub use label::{Label, VrfId};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid forwarding label: {0}")]
    InvalidLabel(u32),
}
