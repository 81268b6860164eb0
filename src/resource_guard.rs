//! Single-instance enforcement for the daemon.
//!
//! Two daemons would each claim the same interfaces and hand the firewall
//! two lifelines for the same ports, so a second instance refuses to start
//! while the PID file names a live process.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// PID file removed again on drop.
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create the PID file, returning None if another live process holds it.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        let pid = std::process::id();

        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read pid file {}", path.display()))?;
            if let Ok(old_pid) = contents.trim().parse::<u32>() {
                if old_pid != pid && Self::process_exists(old_pid) {
                    return Ok(None);
                }
            }
            debug!(path = %path.display(), "removing stale pid file");
            let _ = std::fs::remove_file(path);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, format!("{}\n", pid))
            .with_context(|| format!("failed to write pid file {}", path.display()))?;

        Ok(Some(Self {
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn process_exists(pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 only checks for existence; EPERM still means alive.
        match kill(Pid::from_raw(raw), None::<Signal>) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove pid file: {}", err);
        }
    }
}
