//! Implementation of `lagfs mount` subcommand.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc,
    time::Duration,
};

use clap::Args;
use tracing::{info, instrument, warn};

use crate::{
    fs::{
        fuse,
        passthrough::{Passthrough, PassthroughConfig},
        MountSession, MountTarget,
    },
    logging, Error, Result,
};

const WATCH_INTERVAL: Duration = Duration::from_millis(500);
// Emit an op-metrics snapshot roughly once a minute while mounted.
const METRICS_EVERY: u32 = 120;

#[derive(Debug, Clone, Args)]
pub struct MountArgs {
    /// Directory tree to expose through the mount
    #[arg(long = "root")]
    pub root: Option<PathBuf>,

    /// Path to the mount target directory
    #[arg(long = "mnt-path")]
    pub mnt_path: Option<PathBuf>,

    /// Artificial latency added before every filesystem call, in milliseconds
    #[arg(long = "latency-ms", default_value_t = 0)]
    pub latency_ms: u64,

    /// Disable in-memory extended attribute emulation
    #[arg(long = "no-xattr-emulation")]
    pub no_xattr_emulation: bool,

    /// Allow other users to access the mount (requires user_allow_other)
    #[arg(long = "allow-other")]
    pub allow_other: bool,
}

#[derive(Debug)]
pub struct MountContext {
    pub fs: std::sync::Arc<Passthrough>,
    pub session: MountSession,
    pub fuse_handle: Option<fuse::MountHandle>,
}

pub fn execute(args: MountArgs) -> Result<()> {
    // Execute the mount and hold it until a termination signal is received.
    let mut ctx = mount(args)?;

    if let Some(handle) = ctx.fuse_handle.take() {
        info!("lagfs mount active; press Ctrl+C to unmount");

        #[derive(Debug)]
        enum Event {
            Signal,
            Unmounted,
        }

        let (tx, rx) = mpsc::channel();

        // Handle SIGINT/SIGTERM.
        ctrlc::set_handler({
            let tx = tx.clone();
            move || {
                let _ = tx.send(Event::Signal);
            }
        })
        .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;

        // Watch for external unmounts and sample op metrics while waiting.
        let mount_path = ctx.session.target_path.clone();
        let watched_fs = ctx.fs.clone();
        std::thread::spawn(move || {
            let mut ticks = 0u32;
            loop {
                std::thread::sleep(WATCH_INTERVAL);
                if !is_mounted(&mount_path) {
                    let _ = tx.send(Event::Unmounted);
                    break;
                }
                ticks += 1;
                if ticks % METRICS_EVERY == 0 {
                    logging::log_fs_op_metrics(watched_fs.metrics_snapshot(), false);
                }
            }
        });

        match rx.recv() {
            Ok(Event::Signal) => {
                info!(
                    "signal received; unmounting {}",
                    ctx.session.target_path.display()
                );
                handle.unmount();
            }
            Ok(Event::Unmounted) => {
                info!(
                    "detected external unmount; exiting for {}",
                    ctx.session.target_path.display()
                );
                // Join the session to ensure the background thread is cleaned up.
                handle.unmount();
            }
            Err(_) => {
                handle.unmount();
            }
        }

        ctx.session.mark_unmounted();
        logging::log_fs_op_metrics(ctx.fs.metrics_snapshot(), false);
    }

    Ok(())
}

/// Check if a path is currently mounted (Linux-only, /proc/mounts).
fn is_mounted(path: &Path) -> bool {
    if let Ok(contents) = fs::read_to_string("/proc/mounts") {
        let target = path.to_string_lossy();
        return contents
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|p| p == target);
    }
    false
}

/// Perform mount orchestration used by both the CLI and tests.
#[instrument(skip(args), fields(root = ?args.root, mnt = ?args.mnt_path))]
pub fn mount(args: MountArgs) -> Result<MountContext> {
    let root = args
        .root
        .ok_or_else(|| Error::Cli("root is required".into()))?;
    let mnt_path = args
        .mnt_path
        .ok_or_else(|| Error::Cli("mnt_path is required".into()))?;

    if !root.exists() || !root.is_dir() {
        return Err(Error::InvalidRootDir(root.display().to_string()).into());
    }

    let target = MountTarget::new(&mnt_path);
    target.validate()?;
    info!("validated target directory");

    let config = PassthroughConfig {
        latency: Duration::from_millis(args.latency_ms),
        xattr_emulation: !args.no_xattr_emulation,
    };
    let fs = Passthrough::new(&root, config);

    let mut session = MountSession::new(&root, &mnt_path);

    let fuse_handle = match fuse::spawn_passthrough(fs.clone(), &mnt_path, args.allow_other) {
        Ok(handle) => Some(handle),
        Err(err) => {
            session.mark_failed(err.to_string());
            warn!(mount_id = %session.mount_id, error = %err, "mount failed");
            return Err(err);
        }
    };

    session.mark_ready();
    info!(
        mount_id = %session.mount_id,
        latency_ms = args.latency_ms,
        xattr_emulation = !args.no_xattr_emulation,
        "mount ready"
    );

    Ok(MountContext {
        fs,
        session,
        fuse_handle,
    })
}
