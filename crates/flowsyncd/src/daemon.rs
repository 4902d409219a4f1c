//! The daemon event loop.
//!
//! All mutations of the flow table, the routes and the sync layer are
//! serialized through this single task: events arrive over an mpsc
//! channel, and the timer-driven stats and sync passes run between events.
//! Subsystems therefore never need interior locking, and a bonded pair is
//! never touched by two contexts at once.

use crate::config::FlowSyncConfig;
use crate::flow::{FlowRecord, FlowTable};
use crate::kernel::{KernelFlowTable, SyncScheduler};
use crate::nhg::{NhgComposer, Route, RoutePath};
use crate::shadow::ShadowRegistry;
use crate::stats::{FlowExporter, FlowStatsCollector};
use crate::telemetry::FlowLogSink;
use flow_sync_common::{TaskError, TaskResult, TaskResultExt, TaskStatus};
use flow_types::FlowKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Entries processed per sync pass.
const SYNC_PASS_LIMIT: usize = 256;
/// Depth of the daemon event channel.
const EVENT_CHANNEL_DEPTH: usize = 4096;

/// Events consumed by the daemon.
#[derive(Debug)]
pub enum FlowEvent {
    /// A flow was created or its attributes changed.
    FlowAdd { record: Box<FlowRecord> },
    /// Bond two existing flows as a forward/reverse pair.
    FlowLink { forward: FlowKey, reverse: FlowKey },
    /// Upstream invalidation of a flow, outside the aging path.
    FlowInvalidate { key: FlowKey },
    /// A contributing path appeared or changed on a route.
    PathAdd { route: String, path: RoutePath },
    /// A contributing path went away.
    PathDelete { route: String, peer: String },
    NexthopResolved { name: String, index: u32 },
    NexthopUnresolved { name: String },
    MirrorResolved { name: String, index: u32 },
    MirrorUnresolved { name: String },
    /// Kernel acknowledged the last write for a flow.
    KernelAck { key: FlowKey },
    Shutdown,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Owns every subsystem and drives them from one task context.
pub struct FlowSyncDaemon {
    config: FlowSyncConfig,
    table: FlowTable,
    collector: FlowStatsCollector,
    composer: NhgComposer,
    routes: HashMap<String, Route>,
    scheduler: SyncScheduler,
    nexthops: ShadowRegistry,
    mirrors: ShadowRegistry,
    kernel: Arc<dyn KernelFlowTable>,
    rx: Option<mpsc::Receiver<FlowEvent>>,
}

impl FlowSyncDaemon {
    pub fn new(
        config: FlowSyncConfig,
        kernel: Arc<dyn KernelFlowTable>,
        sink: Arc<dyn FlowLogSink>,
    ) -> (Self, mpsc::Sender<FlowEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let exporter = FlowExporter::new(sink, config.flow_export_rate, config.sampling_threshold);
        let collector = FlowStatsCollector::new(config.clone(), exporter);
        let scheduler = SyncScheduler::new(
            kernel.clone(),
            config.kernel_table_size,
            config.router_id,
            config.mirror_port,
        );
        let daemon = Self {
            config,
            table: FlowTable::new(),
            collector,
            composer: NhgComposer::new(),
            routes: HashMap::new(),
            scheduler,
            nexthops: ShadowRegistry::new("nexthop"),
            mirrors: ShadowRegistry::new("mirror"),
            kernel,
            rx: Some(rx),
        };
        (daemon, tx)
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn collector(&self) -> &FlowStatsCollector {
        &self.collector
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    fn take_shadow_refs(&mut self, record: &FlowRecord) {
        if let Some(nh) = &record.rpf_nexthop {
            self.nexthops.get_or_create_ref(nh);
        }
        for analyzer in record.mirror_analyzers.iter().take(2) {
            self.mirrors.get_or_create_ref(analyzer);
        }
    }

    fn drop_shadow_refs(&mut self, record: &FlowRecord) {
        if let Some(nh) = &record.rpf_nexthop {
            self.nexthops.drop_ref(nh);
        }
        for analyzer in record.mirror_analyzers.iter().take(2) {
            self.mirrors.drop_ref(analyzer);
        }
    }

    fn add_flow(&mut self, mut record: FlowRecord) {
        // Replacing a record exchanges its dependency references.
        if let Some(old) = self.table.get(&record.key) {
            let old = old.clone();
            self.drop_shadow_refs(&old);
            // The kernel index belongs to the key, not the incarnation.
            record.kernel_index = old.kernel_index;
        }
        self.take_shadow_refs(&record);

        let key = record.key;
        let reverse = record.reverse_key;
        self.table.insert(record);
        if let Some(rev_key) = reverse {
            self.table.link_pair(key, rev_key);
        }
        if let Some(rec) = self.table.get(&key) {
            self.scheduler.stage(rec);
        }
    }

    /// Full teardown of one flow: final export, kernel delete, reference
    /// release, registry removal.
    fn delete_flow(&mut self, key: FlowKey, now: u64) {
        if !self.table.contains(&key) {
            return;
        }
        self.collector
            .export_on_delete(&mut self.table, self.kernel.as_ref(), &key, now);
        if let Some(record) = self.table.get(&key) {
            self.scheduler.stage_delete(record);
        }
        if let Some(removed) = self.table.remove(&key) {
            self.drop_shadow_refs(&removed);
        }
    }

    /// Applies one event. Returns false on shutdown.
    ///
    /// Failures never escape: an offending request is dropped with a log
    /// line, and mirroring of every unrelated object continues.
    pub fn handle_event(&mut self, event: FlowEvent) -> bool {
        if matches!(event, FlowEvent::Shutdown) {
            return false;
        }
        let result = self.apply_event(event);
        if let Err(err) = &result {
            match result.to_status() {
                TaskStatus::InvalidEntry => warn!(%err, "event rejected"),
                _ => warn!(%err, "event failed"),
            }
        }
        true
    }

    fn apply_event(&mut self, event: FlowEvent) -> TaskResult<()> {
        match event {
            FlowEvent::FlowAdd { record } => self.add_flow(*record),
            FlowEvent::FlowLink { forward, reverse } => {
                if self.table.link_pair(forward, reverse) {
                    for key in [forward, reverse] {
                        if let Some(rec) = self.table.get(&key) {
                            self.scheduler.stage(rec);
                        }
                    }
                }
            }
            FlowEvent::FlowInvalidate { key } => self.delete_flow(key, now_us()),
            FlowEvent::PathAdd { route, path } => {
                let entry = self
                    .routes
                    .entry(route.clone())
                    .or_insert_with(|| Route::new(route));
                self.composer
                    .path_add(entry, path)
                    .map_err(|e| TaskError::invalid_entry(e.to_string()))?;
            }
            FlowEvent::PathDelete { route, peer } => {
                if let Some(entry) = self.routes.get_mut(&route) {
                    let result = self.composer.path_delete(entry, &peer);
                    if entry.paths.is_empty() && entry.group.is_none() {
                        self.routes.remove(&route);
                    }
                    // A contract violation by the caller; the offending
                    // request is dropped and the agent keeps running.
                    result.map_err(|e| TaskError::invalid_entry(e.to_string()))?;
                }
            }
            FlowEvent::NexthopResolved { name, index } => self.nexthops.resolve(&name, index),
            FlowEvent::NexthopUnresolved { name } => self.nexthops.unresolve(&name),
            FlowEvent::MirrorResolved { name, index } => self.mirrors.resolve(&name, index),
            FlowEvent::MirrorUnresolved { name } => self.mirrors.unresolve(&name),
            FlowEvent::KernelAck { key } => self.scheduler.acknowledge(&key),
            FlowEvent::Shutdown => {}
        }
        Ok(())
    }

    /// One sync pass: resolve dependencies, encode, write.
    pub fn run_sync_pass(&mut self) {
        let assigned =
            self.scheduler
                .run_pass(&self.table, &self.nexthops, &self.mirrors, SYNC_PASS_LIMIT);
        for (key, index) in assigned {
            if let Some(record) = self.table.get_mut(&key) {
                record.kernel_index = Some(index);
            }
        }
    }

    /// One stats pass: reconcile counters, export, age out.
    pub fn run_stats_pass(&mut self, now: u64) {
        let outcome = self
            .collector
            .run_pass(&mut self.table, self.kernel.as_ref(), now);
        for key in outcome.deletions {
            self.delete_flow(key, now);
        }
    }

    /// Runs until the channel closes or a shutdown event arrives.
    pub async fn run(mut self) {
        info!(
            age_timeout_ms = self.config.age_timeout_ms,
            kernel_table_size = self.config.kernel_table_size,
            "flowsyncd event loop started"
        );
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut next_pass = Instant::now() + Duration::from_millis(self.collector.interval_ms());
        loop {
            let deadline = tokio::time::sleep_until(next_pass.into());
            tokio::select! {
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if !self.handle_event(event) {
                                break;
                            }
                            self.run_sync_pass();
                        }
                        None => break,
                    }
                }
                _ = deadline => {
                    self.run_stats_pass(now_us());
                    self.run_sync_pass();
                    next_pass = Instant::now()
                        + Duration::from_millis(self.collector.interval_ms());
                }
            }
        }
        info!("flowsyncd event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowAction;
    use crate::kernel::{InProcessFlowTable, KernelCounterBank, SyncState};
    use crate::nhg::{PathAttributes, PeerClass};
    use crate::telemetry::CollectingSink;
    use flow_types::{FlowFlags, IpAddress, Label, IPPROTO_TCP};
    use std::str::FromStr;

    fn key(sport: u16) -> FlowKey {
        FlowKey::new(
            7,
            IpAddress::from_str("10.0.0.1").unwrap(),
            IpAddress::from_str("10.0.0.2").unwrap(),
            IPPROTO_TCP,
            sport,
            80,
        )
    }

    fn setup() -> (FlowSyncDaemon, Arc<InProcessFlowTable>, Arc<CollectingSink>) {
        let kernel = Arc::new(InProcessFlowTable::new());
        let sink = Arc::new(CollectingSink::new());
        let config = FlowSyncConfig {
            age_timeout_ms: 30_000,
            ..FlowSyncConfig::default()
        };
        let (daemon, _tx) = FlowSyncDaemon::new(
            config,
            kernel.clone() as Arc<dyn KernelFlowTable>,
            sink.clone() as Arc<dyn FlowLogSink>,
        );
        (daemon, kernel, sink)
    }

    fn local_path(peer: &str, nexthop: &str, label: u32) -> RoutePath {
        RoutePath {
            peer: peer.to_string(),
            peer_class: PeerClass::LocalWorkload,
            nexthop: nexthop.to_string(),
            label: Label::new(label),
            ecmp_eligible: true,
            attrs: PathAttributes::default(),
        }
    }

    #[test]
    fn test_flow_add_reaches_kernel_and_learns_index() {
        let (mut daemon, kernel, _) = setup();
        let k = key(1000);
        daemon.handle_event(FlowEvent::FlowAdd {
            record: Box::new(FlowRecord::new(k, 1, 0)),
        });
        daemon.run_sync_pass();

        assert_eq!(kernel.write_count(), 1);
        assert!(daemon.table().get(&k).unwrap().kernel_index.is_some());
        assert_eq!(daemon.scheduler().state_of(&k), Some(SyncState::Encoded));
    }

    #[test]
    fn test_flow_with_unresolved_nexthop_waits_then_encodes() {
        let (mut daemon, kernel, _) = setup();
        let k = key(1000);
        let mut rec = FlowRecord::new(k, 1, 0);
        rec.rpf_nexthop = Some("vm-1".to_string());

        daemon.handle_event(FlowEvent::FlowAdd { record: Box::new(rec) });
        daemon.run_sync_pass();
        assert_eq!(kernel.write_count(), 0);
        assert_eq!(daemon.scheduler().unresolved_depth(), 1);

        daemon.handle_event(FlowEvent::NexthopResolved {
            name: "vm-1".to_string(),
            index: 55,
        });
        daemon.run_sync_pass();
        assert_eq!(kernel.write_count(), 1);
        // The resolved nexthop id rides in the descriptor.
        let writes = kernel.written();
        assert_eq!(&writes[0][55..59], &55u32.to_be_bytes());
    }

    #[test]
    fn test_aging_tears_flow_down_end_to_end() {
        let (mut daemon, kernel, sink) = setup();
        let k = key(1000);
        daemon.handle_event(FlowEvent::FlowAdd {
            record: Box::new(FlowRecord::new(k, 1, 0)),
        });
        daemon.run_sync_pass();
        let index = daemon.table().get(&k).unwrap().kernel_index.unwrap();
        kernel.set_counters(index, KernelCounterBank::default());

        daemon.run_stats_pass(31_000_000);

        assert!(daemon.table().get(&k).is_none());
        // The teardown export went out and the kernel got the delete.
        let records = sink.records();
        assert!(records.iter().any(|r| r.teardown_time_us.is_some()));
        assert_eq!(kernel.slot_count(), 0);
    }

    #[test]
    fn test_nat_pair_lifecycle() {
        let (mut daemon, kernel, _) = setup();
        let fwd = key(1000);
        let rev = key(2000);

        let mut fwd_rec = FlowRecord::new(fwd, 1, 0);
        fwd_rec.flags.set(FlowFlags::NAT);
        fwd_rec.action = FlowAction::Nat;
        let mut rev_rec = FlowRecord::new(rev, 1, 0);
        rev_rec.flags.set(FlowFlags::NAT);
        rev_rec.action = FlowAction::Nat;
        rev_rec.reverse_key = Some(fwd);

        daemon.handle_event(FlowEvent::FlowAdd { record: Box::new(fwd_rec) });
        daemon.handle_event(FlowEvent::FlowLink { forward: fwd, reverse: rev });
        daemon.handle_event(FlowEvent::FlowAdd { record: Box::new(rev_rec) });
        daemon.run_sync_pass();
        daemon.run_sync_pass();

        assert_eq!(daemon.scheduler().state_of(&fwd), Some(SyncState::Encoded));
        assert_eq!(daemon.scheduler().state_of(&rev), Some(SyncState::Encoded));
        assert_eq!(kernel.slot_count(), 2);
    }

    #[test]
    fn test_path_events_drive_composer() {
        let (mut daemon, _, _) = setup();
        daemon.handle_event(FlowEvent::PathAdd {
            route: "10.1.0.0/24".to_string(),
            path: local_path("vm-1", "nh-1", 11),
        });
        daemon.handle_event(FlowEvent::PathAdd {
            route: "10.1.0.0/24".to_string(),
            path: local_path("vm-2", "nh-2", 12),
        });
        assert!(daemon.route("10.1.0.0/24").unwrap().group.is_some());

        daemon.handle_event(FlowEvent::PathDelete {
            route: "10.1.0.0/24".to_string(),
            peer: "vm-2".to_string(),
        });
        assert!(daemon.route("10.1.0.0/24").unwrap().group.is_none());

        // Removing the last path retires the route entirely.
        daemon.handle_event(FlowEvent::PathDelete {
            route: "10.1.0.0/24".to_string(),
            peer: "vm-1".to_string(),
        });
        assert!(daemon.route("10.1.0.0/24").is_none());
    }

    #[test]
    fn test_shadow_refs_follow_flow_lifetime() {
        let (mut daemon, _, _) = setup();
        let k = key(1000);
        let mut rec = FlowRecord::new(k, 1, 0);
        rec.rpf_nexthop = Some("vm-1".to_string());
        rec.mirror_analyzers = vec!["an-1".to_string()];

        daemon.handle_event(FlowEvent::FlowAdd { record: Box::new(rec) });
        assert_eq!(daemon.nexthops.ref_count("vm-1"), Some(1));
        assert_eq!(daemon.mirrors.ref_count("an-1"), Some(1));

        daemon.handle_event(FlowEvent::FlowInvalidate { key: k });
        assert_eq!(daemon.nexthops.ref_count("vm-1"), None);
        assert_eq!(daemon.mirrors.ref_count("an-1"), None);
    }

    #[test]
    fn test_flow_update_does_not_leak_refs() {
        let (mut daemon, _, _) = setup();
        let k = key(1000);
        let mut rec = FlowRecord::new(k, 1, 0);
        rec.rpf_nexthop = Some("vm-1".to_string());

        daemon.handle_event(FlowEvent::FlowAdd { record: Box::new(rec.clone()) });
        daemon.handle_event(FlowEvent::FlowAdd { record: Box::new(rec) });
        assert_eq!(daemon.nexthops.ref_count("vm-1"), Some(1));
    }

    #[test]
    fn test_kernel_ack_advances_state() {
        let (mut daemon, _, _) = setup();
        let k = key(1000);
        daemon.handle_event(FlowEvent::FlowAdd {
            record: Box::new(FlowRecord::new(k, 1, 0)),
        });
        daemon.run_sync_pass();

        daemon.handle_event(FlowEvent::KernelAck { key: k });
        assert_eq!(
            daemon.scheduler().state_of(&k),
            Some(SyncState::Acknowledged)
        );
    }
}
