//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::{info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Snapshot of passthrough operation counters, emitted periodically from the
/// mount watcher so latency injection and failure rates are visible in logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOpSnapshot {
    pub ops_total: u64,
    pub ops_failed: u64,
    pub nodes_tracked: usize,
    pub handles_open: usize,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

/// Emit structured passthrough op metrics. Callers should pass in a
/// periodically sampled snapshot to avoid excessive log volume.
pub fn log_fs_op_metrics(snapshot: FsOpSnapshot, level_warn: bool) {
    if level_warn {
        warn!(
            target = "lagfs::fs",
            ops_total = snapshot.ops_total,
            ops_failed = snapshot.ops_failed,
            nodes_tracked = snapshot.nodes_tracked,
            handles_open = snapshot.handles_open,
            "fs_op_failures"
        );
    } else {
        info!(
            target = "lagfs::fs",
            ops_total = snapshot.ops_total,
            ops_failed = snapshot.ops_failed,
            nodes_tracked = snapshot.nodes_tracked,
            handles_open = snapshot.handles_open,
            "fs_op_snapshot"
        );
    }
}
