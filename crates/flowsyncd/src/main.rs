//! flowsyncd entry point.
//!
//! Wires the daemon to the in-process kernel table stand-in and the
//! structured-log telemetry sink, then runs the event loop until
//! interrupted.

use clap::Parser;
use flowsyncd::config::FlowSyncConfig;
use flowsyncd::daemon::{FlowEvent, FlowSyncDaemon};
use flowsyncd::kernel::{InProcessFlowTable, KernelFlowTable};
use flowsyncd::telemetry::{FlowLogSink, TracingLogSink};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Virtual-router flow lifecycle and multipath synchronization daemon
#[derive(Parser, Debug)]
#[command(name = "flowsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Override the flow age timeout in milliseconds
    #[arg(long)]
    age_timeout_ms: Option<u64>,

    /// Override the kernel flow table capacity
    #[arg(long)]
    kernel_table_size: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut config = match &args.config {
        Some(path) => match FlowSyncConfig::from_yaml_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!("failed to load config {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => FlowSyncConfig::default(),
    };
    if let Some(age) = args.age_timeout_ms {
        config.age_timeout_ms = age;
    }
    if let Some(size) = args.kernel_table_size {
        config.kernel_table_size = size;
    }

    info!("====================================================================");
    info!("Starting flowsyncd");
    info!("====================================================================");
    info!("Age timeout: {}ms", config.age_timeout_ms);
    info!("Kernel table size: {}", config.kernel_table_size);
    info!("Flow export rate: {}/s", config.flow_export_rate);
    info!("Router id: {}", config.router_id);

    let kernel = Arc::new(InProcessFlowTable::new()) as Arc<dyn KernelFlowTable>;
    let sink = Arc::new(TracingLogSink) as Arc<dyn FlowLogSink>;
    let (daemon, tx) = FlowSyncDaemon::new(config, kernel, sink);

    let handle = tokio::spawn(daemon.run());

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to wait for interrupt: {err}");
    }
    info!("shutting down");
    let _ = tx.send(FlowEvent::Shutdown).await;
    let _ = handle.await;

    ExitCode::SUCCESS
}
