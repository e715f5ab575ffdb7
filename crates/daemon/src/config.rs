// DicyVPN - Daemon Config Module
// Handles daemon configuration (listener mode, auth, VPN service, tunnel backend)

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dicyvpn_common::{is_loopback_address, ApiConfig, TunnelSettings, APP_DIR_NAME};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Runtime directory for daemon state (socket, pid file, tunnel config)
///
/// Falls back to `/run/dicyvpn` when no user runtime directory is set, which is
/// the usual case for a system service.
pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| Path::new("/run").join(APP_DIR_NAME))
}

/// Get the socket path for the daemon
pub fn socket_path() -> PathBuf {
    runtime_dir().join("dicyvpn.sock")
}

/// Listener mode for the daemon
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// TCP with HTTP (loopback-only)
    TcpHttp,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind host for TcpHttp mode
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bind port for TcpHttp mode
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Path to authentication token file
    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// Require the X-Daemon-Token header on every request
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// Enable group access to Unix socket and runtime directory
    /// When true, sets permissions to 0770/0660 instead of 0700/0600
    #[serde(default)]
    pub group_access: bool,

    /// Base URL of the VPN service API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// WireGuard interface name (also the generated config file name)
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// wg-quick executable
    #[serde(default = "default_wg_quick_path")]
    pub wg_quick_path: PathBuf,

    /// DNS resolvers pushed into the tunnel
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,

    /// Identifier excluded from the tunnel on backends that support it
    #[serde(default = "default_application_id")]
    pub application_id: String,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    4711
}

fn default_auth_token_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("daemon.token")
}

fn default_require_auth() -> bool {
    true
}

fn default_api_base_url() -> String {
    ApiConfig::default().base_url
}

fn default_interface_name() -> String {
    "dicyvpn".to_string()
}

fn default_wg_quick_path() -> PathBuf {
    PathBuf::from("wg-quick")
}

fn default_dns() -> Vec<String> {
    TunnelSettings::default().dns
}

fn default_application_id() -> String {
    TunnelSettings::default().application_id
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            auth_token_path: default_auth_token_path(),
            require_auth: default_require_auth(),
            group_access: false,
            api_base_url: default_api_base_url(),
            interface_name: default_interface_name(),
            wg_quick_path: default_wg_quick_path(),
            dns: default_dns(),
            application_id: default_application_id(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp && !is_loopback_address(&self.bind_host) {
            anyhow::bail!(
                "Security violation: tcp-http only binds to loopback addresses (bind_host: {}).\n\
                 \n\
                 To fix this:\n\
                 1. Use a loopback address (127.0.0.1, ::1 or localhost) for bind_host, OR\n\
                 2. Change listener_mode to 'unix-socket' in daemon.toml\n\
                 \n\
                 The API controls the VPN tunnel and has no encryption.",
                self.bind_host
            );
        }

        validate_interface_name(&self.interface_name)?;
        self.api_config().validate()?;
        self.tunnel_settings().validate()?;

        Ok(())
    }

    /// Settings for the VPN service client
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_base_url.clone(),
            ..ApiConfig::default()
        }
    }

    /// Settings for rendering tunnel configurations
    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            dns: self.dns.clone(),
            application_id: self.application_id.clone(),
        }
    }

    /// Load daemon configuration, writing the defaults on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(config_path)
            .context("Failed to read daemon configuration")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse daemon configuration")?;

        config.validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents)
            .context("Failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            fs::set_permissions(config_path, permissions)
                .context("Failed to set config file permissions")?;
        }

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        Ok(dicyvpn_common::config_dir()?.join("daemon.toml"))
    }
}

/// Linux interface names: 1-15 bytes, no slashes or whitespace
fn validate_interface_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));
    if !valid {
        anyhow::bail!("Invalid interface_name '{}'", name);
    }
    Ok(())
}

/// Build the CLI config matching this daemon's listener
pub fn cli_config_snippet(
    listener_mode: &ListenerMode,
    bind_host: &str,
    bind_port: u16,
    auth_token: Option<&str>,
) -> String {
    let mut content = String::from(
        "# CLI Configuration for DicyVPN\n\
         # Copy this to ~/.config/dicyvpn/cli.toml\n\
         \n",
    );

    match listener_mode {
        ListenerMode::UnixSocket => {
            let socket = socket_path().display().to_string();
            content.push_str(&format!(
                "connection_mode = \"unix-socket\"\n\
                 # Socket path (auto-detected by default): {}\n\
                 # Uncomment to override:\n\
                 # daemon_url = \"{}\"\n",
                socket, socket
            ));
        }
        ListenerMode::TcpHttp => {
            content.push_str(&format!(
                "connection_mode = \"http\"\n\
                 daemon_host = \"{}\"\n\
                 daemon_port = {}\n",
                bind_host, bind_port
            ));
        }
    }

    if let Some(token) = auth_token {
        content.push_str(&format!("auth_token = \"{}\"\n", token));
    }

    content
}

/// Write CLI config snippet to help users configure their CLI
pub fn write_cli_config_snippet(
    listener_mode: &ListenerMode,
    bind_host: &str,
    bind_port: u16,
    auth_token: Option<&str>,
) -> Result<()> {
    let snippet_path = dicyvpn_common::daemon_client::get_cli_config_snippet_path()?;

    if let Some(parent) = snippet_path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    fs::write(
        &snippet_path,
        cli_config_snippet(listener_mode, bind_host, bind_port, auth_token),
    )
    .context("Failed to write CLI config snippet")?;
    crate::permissions::set_file_permissions_private(&snippet_path)?;

    info!("");
    info!("CLI configuration snippet generated at:");
    info!("  {}", snippet_path.display());
    info!("");
    info!("To configure the CLI, run:");
    info!("  cp {} ~/.config/dicyvpn/cli.toml", snippet_path.display());
    info!("");

    Ok(())
}
