// File modes for the daemon's runtime directory, socket and secrets

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Set restrictive umask so the tunnel config and tokens are never world-readable
/// Should be called early in main() before creating any files
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        // rwx------ for everything the daemon creates
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// Set file permissions to 0600 (owner read/write only)
pub fn set_file_permissions_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        set_mode(path, 0o600)?;
        debug!("Set file permissions to 0600: {}", path.display());
    }
    Ok(())
}

/// 0770 with group access, 0700 otherwise
fn directory_mode(group_access: bool) -> u32 {
    if group_access { 0o770 } else { 0o700 }
}

/// 0660 with group access, 0600 otherwise
fn socket_mode(group_access: bool) -> u32 {
    if group_access { 0o660 } else { 0o600 }
}

/// Set Unix socket permissions based on group_access setting
pub fn set_socket_permissions(path: &Path, group_access: bool) -> Result<()> {
    #[cfg(unix)]
    {
        let mode = socket_mode(group_access);
        set_mode(path, mode)?;
        info!("Set socket permissions to {:o}: {}", mode, path.display());
    }
    Ok(())
}

/// Ensure a directory exists with the mode matching `group_access`
pub fn ensure_directory_with_permissions(path: &Path, group_access: bool) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    #[cfg(unix)]
    {
        let mode = directory_mode(group_access);
        set_mode(path, mode)?;
        info!("Set directory permissions to {:o}: {}", mode, path.display());
    }
    Ok(())
}
