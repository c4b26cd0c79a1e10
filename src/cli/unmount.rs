//! Implementation of `lagfs unmount` subcommand.

use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Args;

use crate::{Error, Result};

#[derive(Debug, Clone, Args)]
pub struct UnmountArgs {
    /// Path to an existing lagfs mount target
    #[arg(long = "mnt-path")]
    pub mnt_path: Option<PathBuf>,
}

pub fn execute(args: UnmountArgs) -> Result<()> {
    let mnt_path = args
        .mnt_path
        .ok_or_else(|| Error::Cli("mnt_path is required".into()))?;

    if !mnt_path.exists() || !mnt_path.is_dir() {
        return Err(Error::InvalidTargetDir(mnt_path.display().to_string()).into());
    }

    system_unmount(&mnt_path)
}

/// Execute an OS-level unmount. Tries `fusermount -u` first, then `umount`.
pub fn system_unmount(mnt_path: &Path) -> Result<()> {
    let path_string = mnt_path.to_string_lossy().to_string();
    let candidates = vec![
        ("fusermount", vec!["-u", path_string.as_str()]),
        ("umount", vec![path_string.as_str()]),
    ];

    let mut saw_not_mounted = false;
    let mut last_stderr: Option<String> = None;

    for (cmd, args) in candidates {
        match Command::new(cmd).args(args).output() {
            Ok(output) => {
                if output.status.success() {
                    return Ok(());
                }

                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let stderr_lower = stderr.to_lowercase();

                // Detect "not mounted" cases so we can surface a precise error.
                if stderr_lower.contains("not mounted")
                    || stderr_lower.contains("not found in /etc/mtab")
                {
                    saw_not_mounted = true;
                    last_stderr = Some(stderr);
                    continue;
                }

                // Detect busy mounts and report a clearer message instead of
                // incorrectly claiming that the target is not mounted.
                if stderr_lower.contains("device or resource busy")
                    || stderr_lower.contains("target is busy")
                {
                    return Err(Error::Cli(format!(
                        "target is busy: {} ({cmd} failed: {})",
                        mnt_path.display(),
                        stderr.trim()
                    ))
                    .into());
                }

                // Record the last stderr for generic failures.
                last_stderr = Some(stderr);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(Error::Io(err).into()),
        }
    }

    if saw_not_mounted {
        return Err(Error::NotMounted(mnt_path.display().to_string()).into());
    }

    if let Some(stderr) = last_stderr {
        return Err(Error::Cli(format!(
            "failed to unmount {}: {}",
            mnt_path.display(),
            stderr.trim()
        ))
        .into());
    }

    Err(Error::NotMounted(mnt_path.display().to_string()).into())
}
