//! Flow telemetry records and the export sink seam.

use flow_types::FlowKey;
use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

/// One exported flow sample.
///
/// Records are built from copied snapshots of the flow record; no consumer
/// ever holds a reference into the flow table, so dispatching can take as
/// long as it likes without blocking a scan.
#[derive(Debug, Clone, Serialize)]
pub struct FlowLogRecord {
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_correlation_id: Option<Uuid>,

    pub source_ip: String,
    pub dest_ip: String,
    pub protocol: u8,
    pub source_port: u16,
    pub dest_port: u16,

    pub bytes: u64,
    pub packets: u64,
    pub diff_bytes: u64,
    pub diff_packets: u64,

    pub source_network: String,
    pub dest_network: String,
    /// True for the ingress leg, false for egress.
    pub ingress: bool,
    pub action: String,
    pub tcp_flags: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_time_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_time_us: Option<u64>,
}

impl FlowLogRecord {
    pub fn for_key(key: &FlowKey) -> Self {
        Self {
            correlation_id: Uuid::nil(),
            reverse_correlation_id: None,
            source_ip: key.src_addr.to_string(),
            dest_ip: key.dst_addr.to_string(),
            protocol: key.protocol,
            source_port: key.src_port,
            dest_port: key.dst_port,
            bytes: 0,
            packets: 0,
            diff_bytes: 0,
            diff_packets: 0,
            source_network: String::new(),
            dest_network: String::new(),
            ingress: true,
            action: String::new(),
            tcp_flags: 0,
            setup_time_us: None,
            teardown_time_us: None,
        }
    }
}

/// Destination for exported flow samples.
pub trait FlowLogSink: Send + Sync {
    fn dispatch(&self, batch: Vec<FlowLogRecord>);
}

/// Default sink: one structured log line per record.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl FlowLogSink for TracingLogSink {
    fn dispatch(&self, batch: Vec<FlowLogRecord>) {
        for record in batch {
            match serde_json::to_string(&record) {
                Ok(json) => tracing::info!(target: "flow_export", "{json}"),
                Err(err) => tracing::warn!("failed to serialize flow record: {err}"),
            }
        }
    }
}

/// Sink that retains every record, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<FlowLogRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FlowLogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

impl FlowLogSink for CollectingSink {
    fn dispatch(&self, batch: Vec<FlowLogRecord>) {
        self.records.lock().unwrap().extend(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_types::{IpAddress, IPPROTO_UDP};
    use std::str::FromStr;

    #[test]
    fn test_record_serializes_without_optional_fields() {
        let key = FlowKey::new(
            1,
            IpAddress::from_str("10.0.0.1").unwrap(),
            IpAddress::from_str("10.0.0.2").unwrap(),
            IPPROTO_UDP,
            5000,
            53,
        );
        let record = FlowLogRecord::for_key(&key);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"source_ip\":\"10.0.0.1\""));
        assert!(!json.contains("setup_time_us"));
        assert!(!json.contains("teardown_time_us"));
    }

    #[test]
    fn test_collecting_sink_accumulates() {
        let key = FlowKey::new(
            1,
            IpAddress::from_str("10.0.0.1").unwrap(),
            IpAddress::from_str("10.0.0.2").unwrap(),
            IPPROTO_UDP,
            5000,
            53,
        );
        let sink = CollectingSink::new();
        sink.dispatch(vec![FlowLogRecord::for_key(&key)]);
        sink.dispatch(vec![FlowLogRecord::for_key(&key)]);
        assert_eq!(sink.len(), 2);
    }
}
