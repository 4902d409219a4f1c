//! Flow counter reconciliation, aging and telemetry export.

pub mod counters;
mod collector;
mod export;

pub use collector::{CollectorStats, FlowStatsCollector, PassOutcome};
pub use export::{ExportStats, FlowExporter};
