//! flowsyncd - Virtual-router flow lifecycle and multipath sync daemon
//!
//! This crate is the data-plane control agent of an SDN virtual router. It
//! mirrors per-flow forwarding state and multipath (ECMP) decisions between
//! the in-memory control-plane model and a kernel-resident forwarding
//! table, ages out idle flows and exports flow telemetry.
//!
//! # Architecture
//!
//! ```text
//! [route / flow events] ──> [NhgComposer] ──┐
//!                                           ├──> [SyncScheduler] ──> [kernel flow table]
//! [flow registry] ──────────────────────────┘            │
//!        ▲                                               ▼
//!        └── [FlowStatsCollector] <── per-index counters ┘
//!                    │
//!                    └──> [FlowLogSink] (telemetry export)
//! ```
//!
//! # Key components
//!
//! - [`flow::FlowTable`]: registry owning every [`flow::FlowRecord`]
//! - [`stats::FlowStatsCollector`]: cursor-resumable aging and counter
//!   reconciliation scan
//! - [`nhg::NhgComposer`]: builds and tears down multipath groups as
//!   contributing paths come and go
//! - [`kernel::SyncScheduler`]: dependency-ordered mirroring of flows into
//!   the kernel table
//! - [`daemon::FlowSyncDaemon`]: event loop tying the above together

pub mod config;
pub mod daemon;
pub mod flow;
pub mod kernel;
pub mod nhg;
pub mod shadow;
pub mod stats;
pub mod telemetry;

pub use flow_sync_common::{TaskError, TaskResult, TaskStatus};
pub use flow_types::{FlowFlags, FlowKey, IpAddress, Label};

pub use config::FlowSyncConfig;
pub use daemon::{FlowEvent, FlowSyncDaemon};
pub use flow::{FlowAction, FlowRecord, FlowTable};
pub use kernel::{KernelFlowTable, SyncScheduler, SyncState};
pub use nhg::{NexthopGroup, NhgComposer, PeerClass};
pub use stats::FlowStatsCollector;
pub use telemetry::{FlowLogRecord, FlowLogSink};
