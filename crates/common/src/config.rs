// Configuration structures shared by the daemon and the CLI

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory name used under the platform config/runtime directories
pub const APP_DIR_NAME: &str = "dicyvpn";

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the VPN service API (without the /v1 suffix)
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

/// Settings used when rendering the WireGuard configuration block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelSettings {
    /// DNS resolvers pushed into the tunnel
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
    /// Identifier of this application, excluded from the tunnel
    #[serde(default = "default_application_id")]
    pub application_id: String,
}

fn default_api_base_url() -> String {
    "https://api.dicyvpn.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "1.1.0.0".to_string()]
}

fn default_application_id() -> String {
    APP_DIR_NAME.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            dns: default_dns(),
            application_id: default_application_id(),
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(Error::Config(format!(
                "API base URL must start with http:// or https:// (got '{}')",
                self.base_url
            )));
        }
        Ok(())
    }
}

impl TunnelSettings {
    pub fn validate(&self) -> Result<()> {
        if self.dns.is_empty() {
            return Err(Error::Config("At least one DNS server is required".to_string()));
        }
        if self.application_id.trim().is_empty() {
            return Err(Error::Config("Application id cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Get the application configuration directory (~/.config/dicyvpn)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join(APP_DIR_NAME))
}
