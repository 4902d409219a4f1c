//! IP address types with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv4 address wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    pub const UNSPECIFIED: Self = Ipv4Address(Ipv4Addr::UNSPECIFIED);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address(Ipv4Addr::new(a, b, c, d))
    }

    pub const fn inner(&self) -> Ipv4Addr {
        self.0
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }

    /// Returns the address as a host-order u32, as carried in mirror
    /// metadata and telemetry records.
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0.octets())
    }
}

impl Default for Ipv4Address {
    fn default() -> Self {
        Ipv4Address::UNSPECIFIED
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv4Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>()
            .map(Ipv4Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Ipv4Address(addr)
    }
}

/// An IPv6 address wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv6Address(Ipv6Addr);

impl Ipv6Address {
    pub const UNSPECIFIED: Self = Ipv6Address(Ipv6Addr::UNSPECIFIED);

    pub const fn inner(&self) -> Ipv6Addr {
        self.0
    }

    pub const fn octets(&self) -> [u8; 16] {
        self.0.octets()
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv6Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv6Addr>()
            .map(Ipv6Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl From<Ipv6Addr> for Ipv6Address {
    fn from(addr: Ipv6Addr) -> Self {
        Ipv6Address(addr)
    }
}

/// An IP address that can be either IPv4 or IPv6.
///
/// Ordered so flow keys can live in an ordered map and be scanned with a
/// resumable cursor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(untagged)]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

impl IpAddress {
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    pub const fn as_ipv4(&self) -> Option<&Ipv4Address> {
        match self {
            IpAddress::V4(addr) => Some(addr),
            IpAddress::V6(_) => None,
        }
    }

    /// Returns the address as 16 bytes, IPv4 rendered as v4-mapped IPv6.
    ///
    /// This is the fixed-width form used by the kernel flow descriptor.
    pub fn to_wire_octets(&self) -> [u8; 16] {
        match self {
            IpAddress::V4(addr) => addr.inner().to_ipv6_mapped().octets(),
            IpAddress::V6(addr) => addr.octets(),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse::<Ipv6Address>().map(IpAddress::V6)
        } else {
            s.parse::<Ipv4Address>().map(IpAddress::V4)
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(Ipv4Address(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(Ipv6Address(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_v4() {
        let addr = IpAddress::from_str("10.1.1.1").unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.to_string(), "10.1.1.1");
    }

    #[test]
    fn test_parse_v6() {
        let addr = IpAddress::from_str("2001:db8::1").unwrap();
        assert!(!addr.is_ipv4());
    }

    #[test]
    fn test_parse_invalid() {
        assert!(IpAddress::from_str("not-an-ip").is_err());
        assert!(IpAddress::from_str("10.1.1").is_err());
    }

    #[test]
    fn test_wire_octets_v4_mapped() {
        let addr = IpAddress::from_str("192.0.2.1").unwrap();
        let octets = addr.to_wire_octets();
        assert_eq!(&octets[..10], &[0u8; 10]);
        assert_eq!(&octets[10..12], &[0xff, 0xff]);
        assert_eq!(&octets[12..], &[192, 0, 2, 1]);
    }

    #[test]
    fn test_v4_to_u32() {
        let addr = Ipv4Address::new(10, 0, 0, 1);
        assert_eq!(addr.to_u32(), 0x0a00_0001);
    }
}
