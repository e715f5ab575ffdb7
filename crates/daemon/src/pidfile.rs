// DicyVPN - PID File Management
// Only one daemon may own the tunnel interface

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

const PID_FILE_NAME: &str = "dicyvpnd.pid";

/// PID file guard - automatically removes PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim `<dir>/dicyvpnd.pid`
    ///
    /// Fails when the PID recorded there belongs to a live process. A stale or
    /// unreadable file is replaced.
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(PID_FILE_NAME);

        if let Some(pid) = Self::read_pid(&path) {
            if Self::is_process_running(pid) {
                anyhow::bail!(
                    "Daemon is already running with PID {}. \
                     Stop the existing daemon first or remove {} if it's stale.",
                    pid,
                    path.display()
                );
            }
            warn!("Found stale PID file for process {} (not running), removing it", pid);
            fs::remove_file(&path).context("Failed to remove stale PID file")?;
        }

        fs::create_dir_all(dir).context("Failed to create runtime directory")?;

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;

        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self { path })
    }

    fn read_pid(path: &Path) -> Option<u32> {
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(path) {
            Ok(contents) => contents.trim().parse().ok(),
            Err(e) => {
                warn!("Failed to read PID file {}: {}", path.display(), e);
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    /// Check if a process with the given PID is running
    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };

        // kill(pid, 0) only checks for existence and permission
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }

        // EPERM: the process exists but belongs to someone else
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        warn!("Process existence check not implemented for this platform");
        true
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => {
                debug!("Removed PID file: {}", self.path.display());
            }
            Err(e) => {
                warn!("Failed to remove PID file {}: {}", self.path.display(), e);
            }
        }
    }
}
