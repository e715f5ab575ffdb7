// DicyVPN - CLI Config Module
// Handles CLI configuration for connecting to the daemon
// Daemon client logic lives in dicyvpn-common::daemon_client

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use dicyvpn_common::DaemonClientConfig;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,

    /// The user agreed to the terms for secondary servers
    #[serde(default)]
    pub accepted_secondary_servers: bool,
}

impl CliConfig {
    /// Load CLI configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(config_path).context("Failed to read CLI configuration")?;

        toml::from_str(&contents).context("Failed to parse CLI configuration")
    }

    /// Save CLI configuration, keeping the auth token private
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("Failed to serialize CLI configuration")?;
        fs::write(config_path, contents).context("Failed to write CLI configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(config_path, fs::Permissions::from_mode(0o600))
                .context("Failed to set CLI config permissions")?;
        }

        Ok(())
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        Ok(dicyvpn_common::config_dir()?.join("cli.toml"))
    }
}
