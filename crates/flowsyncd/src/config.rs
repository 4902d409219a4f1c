//! Daemon configuration.

use flow_types::{FlowKey, Ipv4Address};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Default flow idle timeout.
pub const DEFAULT_AGE_TIMEOUT_MS: u64 = 180_000;
/// Timeout for TCP flows stuck in SYN without establishing.
pub const DEFAULT_TCP_SYN_AGE_TIMEOUT_MS: u64 = 180_000;
/// Floor for the recomputed scan interval.
pub const DEFAULT_SCAN_INTERVAL_FLOOR_MS: u64 = 50;
/// Cap for the recomputed scan interval.
pub const DEFAULT_SCAN_INTERVAL_CAP_MS: u64 = 1_000;
/// Minimum flows visited per scan pass.
pub const DEFAULT_BATCH_FLOOR: u32 = 100;
/// Sizing assumption feeding the scan-interval multiplier.
pub const DEFAULT_MAX_FLOWS: u32 = 500_000;
/// Default byte-delta sampling threshold for export.
pub const DEFAULT_SAMPLING_THRESHOLD: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Configuration of the flowsync daemon.
///
/// Loaded from YAML; every field has a default so a partial (or absent)
/// file is fine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowSyncConfig {
    /// Idle timeout before a flow is aged out, milliseconds.
    pub age_timeout_ms: u64,
    /// Per-protocol overrides of the idle timeout.
    pub protocol_age_overrides: HashMap<u8, u64>,
    /// Per-destination-port overrides of the idle timeout. Applied only to
    /// TCP and UDP flows and with priority over the protocol override.
    pub port_age_overrides: HashMap<u16, u64>,
    /// Timeout for TCP flows that never left the SYN handshake.
    pub tcp_syn_age_timeout_ms: u64,
    /// Whether short flows are deleted on the first pass that sees them.
    pub delete_short_flows: bool,

    /// Configured flow export rate, records per second. 0 disables export.
    pub flow_export_rate: u32,
    /// Initial byte-delta threshold for export sampling.
    pub sampling_threshold: u64,

    pub scan_interval_floor_ms: u64,
    pub scan_interval_cap_ms: u64,
    pub batch_floor: u32,
    /// Expected table size at the default timeout; feeds the scan
    /// multiplier so bigger tables scan proportionally faster.
    pub max_flows: u32,

    /// Capacity of the kernel flow table.
    pub kernel_table_size: u32,
    /// This router's address, used as the mirror capture host.
    pub router_id: Ipv4Address,
    /// UDP source port for mirrored packets.
    pub mirror_port: u16,
}

impl Default for FlowSyncConfig {
    fn default() -> Self {
        Self {
            age_timeout_ms: DEFAULT_AGE_TIMEOUT_MS,
            protocol_age_overrides: HashMap::new(),
            port_age_overrides: HashMap::new(),
            tcp_syn_age_timeout_ms: DEFAULT_TCP_SYN_AGE_TIMEOUT_MS,
            delete_short_flows: true,
            flow_export_rate: 100,
            sampling_threshold: DEFAULT_SAMPLING_THRESHOLD,
            scan_interval_floor_ms: DEFAULT_SCAN_INTERVAL_FLOOR_MS,
            scan_interval_cap_ms: DEFAULT_SCAN_INTERVAL_CAP_MS,
            batch_floor: DEFAULT_BATCH_FLOOR,
            max_flows: DEFAULT_MAX_FLOWS,
            kernel_table_size: 512 * 1024,
            router_id: Ipv4Address::UNSPECIFIED,
            mirror_port: 6343,
        }
    }
}

impl FlowSyncConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Idle timeout for one flow, microseconds.
    ///
    /// Port override wins over protocol override wins over the global
    /// timeout.
    pub fn age_timeout_us_for(&self, key: &FlowKey) -> u64 {
        let ms = if key.has_ports() {
            self.port_age_overrides
                .get(&key.dst_port)
                .or_else(|| self.protocol_age_overrides.get(&key.protocol))
                .copied()
                .unwrap_or(self.age_timeout_ms)
        } else {
            self.protocol_age_overrides
                .get(&key.protocol)
                .copied()
                .unwrap_or(self.age_timeout_ms)
        };
        ms * 1_000
    }

    pub fn age_timeout_us(&self) -> u64 {
        self.age_timeout_ms * 1_000
    }

    pub fn tcp_syn_age_timeout_us(&self) -> u64 {
        self.tcp_syn_age_timeout_ms * 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_types::{IpAddress, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
    use std::io::Write;
    use std::str::FromStr;

    fn key(protocol: u8, dst_port: u16) -> FlowKey {
        FlowKey::new(
            1,
            IpAddress::from_str("10.0.0.1").unwrap(),
            IpAddress::from_str("10.0.0.2").unwrap(),
            protocol,
            1234,
            dst_port,
        )
    }

    #[test]
    fn test_defaults() {
        let cfg = FlowSyncConfig::default();
        assert_eq!(cfg.age_timeout_ms, DEFAULT_AGE_TIMEOUT_MS);
        assert_eq!(cfg.age_timeout_us(), DEFAULT_AGE_TIMEOUT_MS * 1000);
        assert!(cfg.delete_short_flows);
    }

    #[test]
    fn test_override_priority() {
        let mut cfg = FlowSyncConfig::default();
        cfg.protocol_age_overrides.insert(IPPROTO_UDP, 10_000);
        cfg.port_age_overrides.insert(53, 5_000);

        // Port override wins for UDP/53.
        assert_eq!(cfg.age_timeout_us_for(&key(IPPROTO_UDP, 53)), 5_000_000);
        // Protocol override applies to other UDP ports.
        assert_eq!(cfg.age_timeout_us_for(&key(IPPROTO_UDP, 123)), 10_000_000);
        // Global default for everything else.
        assert_eq!(
            cfg.age_timeout_us_for(&key(IPPROTO_TCP, 80)),
            DEFAULT_AGE_TIMEOUT_MS * 1000
        );
    }

    #[test]
    fn test_port_override_ignored_for_portless_protocols() {
        let mut cfg = FlowSyncConfig::default();
        cfg.port_age_overrides.insert(0, 5_000);
        assert_eq!(
            cfg.age_timeout_us_for(&key(IPPROTO_ICMP, 0)),
            DEFAULT_AGE_TIMEOUT_MS * 1000
        );
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "age_timeout_ms: 30000\nflow_export_rate: 50\nrouter_id: 192.0.2.7"
        )
        .unwrap();

        let cfg = FlowSyncConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(cfg.age_timeout_ms, 30_000);
        assert_eq!(cfg.flow_export_rate, 50);
        assert_eq!(cfg.router_id, Ipv4Address::new(192, 0, 2, 7));
        // Unset fields keep their defaults.
        assert_eq!(cfg.mirror_port, 6343);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "age_timeout_msec: 30000").unwrap();
        assert!(FlowSyncConfig::from_yaml_file(file.path()).is_err());
    }
}
