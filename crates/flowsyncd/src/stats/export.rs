//! Telemetry export with adaptive sampling.
//!
//! Samples below the byte-delta threshold are exported probabilistically
//! and their counts normalized upward by the sampling probability, so the
//! aggregate seen downstream stays unbiased. The threshold adapts to how
//! far the measured export rate overshoots the configured rate.

use crate::flow::FlowRecord;
use crate::telemetry::{FlowLogRecord, FlowLogSink};
use rand::Rng;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Records batched per dispatch.
const MAX_RECORDS_PER_DISPATCH: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct ExportStats {
    pub exported: u64,
    pub drops: u64,
    pub dispatches: u64,
}

/// Builds and dispatches flow telemetry records.
pub struct FlowExporter {
    sink: Arc<dyn FlowLogSink>,
    batch: Vec<FlowLogRecord>,

    configured_rate: u32,
    threshold: u64,
    default_threshold: u64,
    measured_rate: u32,
    export_count: u64,
    prev_rate_compute_us: u64,
    prev_configured_rate: u32,

    stats: ExportStats,
}

impl FlowExporter {
    pub fn new(sink: Arc<dyn FlowLogSink>, configured_rate: u32, threshold: u64) -> Self {
        Self {
            sink,
            batch: Vec::with_capacity(MAX_RECORDS_PER_DISPATCH),
            configured_rate,
            threshold: threshold.max(1),
            default_threshold: threshold.max(1),
            measured_rate: 0,
            export_count: 0,
            prev_rate_compute_us: 0,
            prev_configured_rate: configured_rate,
            stats: ExportStats::default(),
        }
    }

    pub fn stats(&self) -> &ExportStats {
        &self.stats
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn measured_rate(&self) -> u32 {
        self.measured_rate
    }

    /// Exports one flow sample, honoring the sampling algorithm.
    ///
    /// The first export of a record carries its setup time. A teardown
    /// export carries the teardown time and clears the exported marker, so
    /// a key deleted and re-created before cleanup re-announces setup.
    /// Local flows (both endpoints co-resident) emit two records, one per
    /// direction, under distinct correlation ids.
    pub fn export(
        &mut self,
        record: &mut FlowRecord,
        reverse_id: Option<Uuid>,
        diff_bytes: u64,
        diff_packets: u64,
    ) {
        if self.configured_rate == 0 {
            self.stats.drops += 1;
            return;
        }

        let mut diff_bytes = diff_bytes;
        let mut diff_packets = diff_packets;
        let subject_to_sampling = diff_bytes < self.threshold
            && self.measured_rate as f64 >= self.configured_rate as f64 * 0.8;
        if subject_to_sampling {
            let probability = diff_bytes as f64 / self.threshold as f64;
            let pick = rand::thread_rng().gen_range(0..self.threshold);
            if pick > diff_bytes {
                self.stats.drops += 1;
                return;
            }
            if probability == 0.0 {
                diff_bytes = 0;
                diff_packets = 0;
            } else {
                diff_bytes = (diff_bytes as f64 / probability) as u64;
                diff_packets = (diff_packets as f64 / probability) as u64;
            }
        }

        let mut sample = FlowLogRecord::for_key(&record.key);
        sample.correlation_id = record.correlation_id;
        sample.reverse_correlation_id = reverse_id;
        sample.bytes = record.bytes;
        sample.packets = record.packets;
        sample.diff_bytes = diff_bytes;
        sample.diff_packets = diff_packets;
        sample.source_network = record.source_network.clone();
        sample.dest_network = record.dest_network.clone();
        sample.action = record.action.as_str().to_string();
        sample.tcp_flags = record.tcp_flags;

        if !record.exported {
            sample.setup_time_us = Some(record.setup_time_us);
            record.exported = true;
        }
        if record.teardown_time_us != 0 {
            sample.teardown_time_us = Some(record.teardown_time_us);
            record.exported = false;
        }

        if record.is_local() {
            // One conversation, two endpoints on this router: emit the
            // ingress and egress legs separately so downstream queries by
            // direction see both.
            sample.ingress = true;
            self.override_nat_source(record, &mut sample);
            let mut egress = sample.clone();
            self.enqueue(sample);

            egress.ingress = false;
            egress.correlation_id = record.egress_correlation_id;
            self.enqueue(egress);
            self.export_count += 2;
            self.stats.exported += 2;
        } else {
            sample.ingress = record.is_ingress();
            if sample.ingress {
                self.override_nat_source(record, &mut sample);
            }
            self.enqueue(sample);
            self.export_count += 1;
            self.stats.exported += 1;
        }
    }

    /// Ingress NAT flows report the translated source so records correlate
    /// with the post-rewrite packets.
    fn override_nat_source(&self, record: &FlowRecord, sample: &mut FlowLogRecord) {
        if !record.is_nat() {
            return;
        }
        if let Some(rev_key) = &record.reverse_key {
            if record.key.src_addr != rev_key.dst_addr {
                sample.source_ip = rev_key.dst_addr.to_string();
            }
        }
    }

    fn enqueue(&mut self, sample: FlowLogRecord) {
        self.batch.push(sample);
        if self.batch.len() >= MAX_RECORDS_PER_DISPATCH {
            self.flush();
        }
    }

    /// Dispatches whatever is batched.
    pub fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        self.batch = Vec::with_capacity(MAX_RECORDS_PER_DISPATCH);
        self.sink.dispatch(batch);
        self.stats.dispatches += 1;
    }

    /// Recomputes the measured export rate and adapts the sampling
    /// threshold to it.
    pub fn update_threshold(&mut self, now_us: u64) {
        if self.export_count == 0 {
            return;
        }
        if self.prev_rate_compute_us == 0 {
            self.prev_rate_compute_us = now_us;
            self.export_count = 0;
            return;
        }

        let mut rate_computed = false;
        let diff_secs = now_us.saturating_sub(self.prev_rate_compute_us) / 1_000_000;
        if diff_secs > 0 {
            self.measured_rate = (self.export_count / diff_secs) as u32;
            self.prev_rate_compute_us = now_us;
            self.export_count = 0;
            rate_computed = true;
        }

        if !rate_computed && self.configured_rate == self.prev_configured_rate {
            return;
        }

        let cfg = self.configured_rate as f64;
        let measured = self.measured_rate as f64;
        if measured < cfg * 0.8 {
            self.threshold = self.default_threshold;
        } else if measured > cfg * 3.0 {
            self.threshold *= 4;
        } else if measured > cfg * 2.0 {
            self.threshold *= 3;
        } else if measured > cfg * 1.25 {
            self.threshold *= 2;
        }
        self.prev_configured_rate = self.configured_rate;
        debug!(
            measured = self.measured_rate,
            threshold = self.threshold,
            "export threshold updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CollectingSink;
    use flow_types::{FlowFlags, FlowKey, IpAddress, IPPROTO_TCP};
    use std::str::FromStr;

    fn key(src: &str, sport: u16, dst: &str, dport: u16) -> FlowKey {
        FlowKey::new(
            1,
            IpAddress::from_str(src).unwrap(),
            IpAddress::from_str(dst).unwrap(),
            IPPROTO_TCP,
            sport,
            dport,
        )
    }

    fn record() -> FlowRecord {
        FlowRecord::new(key("10.0.0.1", 4000, "10.0.0.2", 80), 1, 1_000)
    }

    fn exporter(sink: &Arc<CollectingSink>) -> FlowExporter {
        FlowExporter::new(sink.clone() as Arc<dyn FlowLogSink>, 100, 500)
    }

    #[test]
    fn test_first_export_carries_setup_time() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = exporter(&sink);
        let mut rec = record();

        exp.export(&mut rec, None, 100, 1);
        exp.export(&mut rec, None, 50, 1);
        exp.flush();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].setup_time_us, Some(1_000));
        assert!(records[1].setup_time_us.is_none());
        assert!(rec.exported);
    }

    #[test]
    fn test_teardown_resets_exported_marker() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = exporter(&sink);
        let mut rec = record();

        exp.export(&mut rec, None, 100, 1);
        rec.teardown_time_us = 9_000;
        exp.export(&mut rec, None, 10, 1);
        exp.flush();

        let records = sink.records();
        assert_eq!(records[1].teardown_time_us, Some(9_000));
        // Marker cleared: a re-created record re-announces setup.
        assert!(!rec.exported);
    }

    #[test]
    fn test_local_flow_emits_both_directions() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = exporter(&sink);
        let mut rec = record();
        rec.flags.set(FlowFlags::LOCAL);

        exp.export(&mut rec, None, 100, 1);
        exp.flush();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records[0].ingress);
        assert!(!records[1].ingress);
        assert_eq!(records[0].correlation_id, rec.correlation_id);
        assert_eq!(records[1].correlation_id, rec.egress_correlation_id);
        assert_ne!(records[0].correlation_id, records[1].correlation_id);
    }

    #[test]
    fn test_nat_ingress_source_override() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = exporter(&sink);
        let mut rec = record();
        rec.flags.set(FlowFlags::NAT | FlowFlags::INGRESS);
        rec.reverse_key = Some(key("10.0.0.2", 80, "203.0.113.9", 4000));

        exp.export(&mut rec, None, 100, 1);
        exp.flush();

        assert_eq!(sink.records()[0].source_ip, "203.0.113.9");
    }

    #[test]
    fn test_disabled_export_rate_drops_everything() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = FlowExporter::new(sink.clone() as Arc<dyn FlowLogSink>, 0, 500);
        let mut rec = record();

        exp.export(&mut rec, None, 100, 1);
        exp.flush();
        assert!(sink.is_empty());
        assert_eq!(exp.stats().drops, 1);
    }

    #[test]
    fn test_batch_dispatches_at_capacity() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = exporter(&sink);
        let mut rec = record();

        for _ in 0..MAX_RECORDS_PER_DISPATCH {
            exp.export(&mut rec, None, 100, 1);
        }
        // Dispatched without an explicit flush.
        assert_eq!(sink.len(), MAX_RECORDS_PER_DISPATCH);
        assert_eq!(exp.stats().dispatches, 1);
    }

    #[test]
    fn test_threshold_adapts_to_overshoot() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = exporter(&sink);
        let mut rec = record();

        // Warm-up call pins the rate-computation epoch.
        exp.export(&mut rec, None, 600, 1);
        exp.update_threshold(1_000_000);

        // 400 exports in one second >> 3x the configured 100/s.
        for _ in 0..400 {
            exp.export(&mut rec, None, 600, 1);
        }
        exp.update_threshold(2_000_000);
        assert_eq!(exp.measured_rate(), 400);
        assert_eq!(exp.threshold(), 2_000);

        // Rate back under 80% of configured: threshold snaps back. Deltas
        // above the raised threshold bypass sampling entirely.
        for _ in 0..10 {
            exp.export(&mut rec, None, 2_500, 1);
        }
        exp.update_threshold(3_000_000);
        assert_eq!(exp.threshold(), 500);
    }

    #[test]
    fn test_sampling_normalizes_counts() {
        let sink = Arc::new(CollectingSink::new());
        let mut exp = exporter(&sink);
        let mut rec = record();

        // Force the sampling path: measured rate at the configured rate.
        exp.export(&mut rec, None, 600, 1);
        exp.update_threshold(1_000_000);
        for _ in 0..100 {
            exp.export(&mut rec, None, 600, 1);
        }
        exp.update_threshold(2_000_000);
        assert!(exp.measured_rate() >= 80);

        // Every sampled export that survives must be normalized upward.
        let before = sink.len() + exp.batch.len();
        for _ in 0..50 {
            exp.export(&mut rec, None, 250, 10);
        }
        exp.flush();
        let records = sink.records();
        for sample in &records[before..] {
            assert!(sample.diff_bytes >= 250);
            assert!(sample.diff_packets >= 10);
        }
    }
}
