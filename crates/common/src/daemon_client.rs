// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// Daemon Client Module
// Shared daemon connection logic for the CLI

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::APP_DIR_NAME;
use crate::network::format_host_port;
use crate::sse::parse_data_line;
use crate::types::{LoginRequest, Server, ServerList, StatusEvent, StatusResponse, TunnelStatus};

/// Header carrying the daemon access token
pub const DAEMON_TOKEN_HEADER: &str = "X-Daemon-Token";

/// `WWW-Authenticate` value sent when the daemon token is missing or wrong
pub const DAEMON_AUTH_SCHEME: &str = "daemon-token";

/// Socket file name inside the runtime directory
pub const SOCKET_FILE_NAME: &str = "dicyvpn.sock";

/// Connection mode for client to daemon communication
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// Plain HTTP on a loopback address
    Http,
}

/// Client configuration for connecting to daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Daemon host for HTTP mode
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port for HTTP mode
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Socket path override for UnixSocket mode (optional)
    #[serde(default)]
    pub daemon_url: String,

    /// Authentication token (if daemon requires auth)
    #[serde(default)]
    pub auth_token: String,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    4711
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            daemon_url: String::new(),
            auth_token: String::new(),
        }
    }
}

impl DaemonClientConfig {
    /// Get the daemon base URL based on connection mode
    pub fn daemon_base_url(&self) -> Result<String> {
        match self.connection_mode {
            // reqwest still wants a URL when talking over a unix socket
            ConnectionMode::UnixSocket => Ok("http://daemon".to_string()),
            ConnectionMode::Http => {
                if self.daemon_host.is_empty() {
                    anyhow::bail!("daemon_host is required for HTTP mode but is empty");
                }
                Ok(format!(
                    "http://{}",
                    format_host_port(&self.daemon_host, self.daemon_port)
                ))
            }
        }
    }

    /// Get the Unix socket path (for UnixSocket mode)
    ///
    /// Checks, in order: an explicit path in `daemon_url`, the user runtime
    /// directory (`/run/user/<uid>/dicyvpn/dicyvpn.sock`) and the system-wide
    /// location (`/run/dicyvpn/dicyvpn.sock`).
    pub fn socket_path(&self) -> Result<PathBuf> {
        let candidate = self.daemon_url.trim();
        if !candidate.is_empty()
            && (candidate.starts_with('/') || candidate.starts_with("./") || candidate.starts_with("../"))
        {
            return Ok(PathBuf::from(candidate));
        }

        let user_socket = dirs::runtime_dir().map(|dir| user_socket_path(&dir));
        if let Some(path) = user_socket.as_ref().filter(|p| p.exists()) {
            return Ok(path.clone());
        }

        let system_socket = Path::new("/run").join(APP_DIR_NAME).join(SOCKET_FILE_NAME);
        if system_socket.exists() {
            return Ok(system_socket);
        }

        // Neither exists yet: default to the user location, the daemon creates it
        user_socket.ok_or_else(|| {
            anyhow::anyhow!("Could not determine runtime directory and no system socket found")
        })
    }
}

fn user_socket_path(runtime_dir: &Path) -> PathBuf {
    if runtime_dir.file_name() == Some(OsStr::new(APP_DIR_NAME)) {
        runtime_dir.join(SOCKET_FILE_NAME)
    } else {
        runtime_dir.join(APP_DIR_NAME).join(SOCKET_FILE_NAME)
    }
}

/// Create an HTTP client configured to connect to the daemon
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    let mut client_builder = Client::builder().connect_timeout(Duration::from_secs(10));

    if config.connection_mode == ConnectionMode::UnixSocket {
        client_builder = client_builder.unix_socket(config.socket_path()?);
    }

    client_builder
        .build()
        .context("Failed to build daemon client")
}

/// Add authentication header to request if configured
pub fn add_auth_header(
    request: reqwest::RequestBuilder,
    config: &DaemonClientConfig,
) -> Result<reqwest::RequestBuilder> {
    if !config.auth_token.is_empty() {
        Ok(request.header(DAEMON_TOKEN_HEADER, &config.auth_token))
    } else {
        Ok(request)
    }
}

/// Get the path to the daemon-generated CLI config snippet
pub fn get_cli_config_snippet_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(config_dir.join(APP_DIR_NAME).join("cli-config.snippet"))
}

/// Result type for config validation
#[derive(Debug)]
pub enum ConfigValidationResult {
    /// Config is valid and ready to use
    Valid,
    /// Config file doesn't exist but snippet is available
    MissingConfigSnippetAvailable(PathBuf),
    /// Config file doesn't exist and no snippet available
    MissingConfigNoSnippet,
}

/// Check the CLI config before attempting a daemon connection
pub fn validate_daemon_config(config_path: &Path) -> ConfigValidationResult {
    if config_path.exists() {
        return ConfigValidationResult::Valid;
    }

    if let Ok(snippet_path) = get_cli_config_snippet_path() {
        if snippet_path.exists() {
            return ConfigValidationResult::MissingConfigSnippetAvailable(snippet_path);
        }
    }

    ConfigValidationResult::MissingConfigNoSnippet
}

/// Error body returned by the daemon
#[derive(Debug, Deserialize)]
struct DaemonError {
    error: String,
}

fn unauthorized_message() -> String {
    "Authentication failed: 401 Unauthorized\n\n\
     The daemon requires authentication but no valid token was provided.\n\
     \n\
     To fix this, copy the snippet the daemon generated on first startup:\n\
        cp ~/.config/dicyvpn/cli-config.snippet ~/.config/dicyvpn/cli.toml\n\
     \n\
     or add the auth_token from ~/.config/dicyvpn/daemon.token to ~/.config/dicyvpn/cli.toml"
        .to_string()
}

/// Turn a non-success daemon response into an error with the daemon's message
async fn daemon_error(context: &str, response: Response) -> anyhow::Error {
    let status = response.status();
    // The daemon's own auth layer tags its 401s; others come from the VPN service
    let daemon_auth_failure = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .is_some_and(|value| value == DAEMON_AUTH_SCHEME);
    if status == StatusCode::UNAUTHORIZED && daemon_auth_failure {
        return anyhow::anyhow!(unauthorized_message());
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<DaemonError>(&body) {
        Ok(err) => anyhow::anyhow!("{}: {}", context, err.error),
        Err(_) => anyhow::anyhow!("{}: {} - {}", context, status, body),
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &Client,
    config: &DaemonClientConfig,
    path: &str,
    context: &str,
) -> Result<T> {
    let url = format!("{}{}", config.daemon_base_url()?, path);
    let response = add_auth_header(client.get(&url), config)?
        .send()
        .await
        .context("Failed to reach the daemon. Is dicyvpnd running?")?;

    if !response.status().is_success() {
        return Err(daemon_error(context, response).await);
    }

    response
        .json()
        .await
        .with_context(|| format!("{}: invalid response", context))
}

async fn post(
    client: &Client,
    config: &DaemonClientConfig,
    path: &str,
    body: Option<&LoginRequest>,
    context: &str,
) -> Result<Response> {
    let url = format!("{}{}", config.daemon_base_url()?, path);
    let mut request = add_auth_header(client.post(&url), config)?;
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request
        .send()
        .await
        .context("Failed to reach the daemon. Is dicyvpnd running?")?;

    if !response.status().is_success() {
        return Err(daemon_error(context, response).await);
    }
    Ok(response)
}

/// Check that the daemon answers
pub async fn health(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    let url = format!("{}/api/health", config.daemon_base_url()?);
    let response = add_auth_header(client.get(&url), config)?
        .send()
        .await
        .context("Failed to reach the daemon. Is dicyvpnd running?")?;

    if !response.status().is_success() {
        return Err(daemon_error("Daemon health check failed", response).await);
    }
    Ok(())
}

/// Fetch the current tunnel status
pub async fn get_status(client: &Client, config: &DaemonClientConfig) -> Result<StatusResponse> {
    get_json(client, config, "/api/status", "Failed to get status").await
}

/// Fetch the server catalog through the daemon
pub async fn list_servers(client: &Client, config: &DaemonClientConfig) -> Result<ServerList> {
    get_json(client, config, "/api/servers", "Failed to list servers").await
}

/// Log in to the VPN service through the daemon
pub async fn login(
    client: &Client,
    config: &DaemonClientConfig,
    email: &str,
    password: &str,
) -> Result<()> {
    let request = LoginRequest {
        email: email.to_string(),
        password: password.to_string(),
    };
    post(client, config, "/api/login", Some(&request), "Login failed").await?;
    Ok(())
}

/// Log out and forget the stored credentials
pub async fn logout(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    post(client, config, "/api/logout", None, "Logout failed").await?;
    Ok(())
}

/// Ask the daemon to disconnect the tunnel
pub async fn disconnect(client: &Client, config: &DaemonClientConfig) -> Result<()> {
    post(client, config, "/api/disconnect", None, "Failed to disconnect").await?;
    Ok(())
}

// ============================================================================
// SSE-first connect flow
// ============================================================================

/// Callbacks for following a connect attempt
pub trait ConnectEventHandler: Send {
    /// Called for every status change seen while waiting (optional)
    fn on_status(&mut self, _status: TunnelStatus, _server: Option<&Server>) {}

    /// Called once the tunnel is up (optional)
    fn on_connected(&mut self, _server: Option<&Server>) {}
}

/// Connect to a server and follow the event stream until the tunnel is up
///
/// Subscribes to `/api/events` before sending the connect request so no
/// transition is missed, then waits for `connected` on `server_id`. The stream
/// opens with the state from before the request, so a `connected` naming another
/// server is skipped until the daemon reports `connecting`. A `not_running` status is
/// only treated as a failure once it has been stable for a short settle window,
/// since a server switch passes through it while the old interface goes down.
pub async fn connect_with_events<H: ConnectEventHandler>(
    client: &Client,
    config: &DaemonClientConfig,
    server_id: &str,
    handler: &mut H,
) -> Result<()> {
    let base_url = config.daemon_base_url()?;

    let client_for_events = client.clone();
    let config_for_events = config.clone();
    let events_url = format!("{}/api/events", base_url);
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<Result<StatusEvent>>();
    let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel::<Result<()>>(1);

    let reader = tokio::spawn(async move {
        let request = match add_auth_header(client_for_events.get(&events_url), &config_for_events) {
            Ok(request) => request,
            Err(e) => {
                let _ = ready_tx.send(Err(e)).await;
                return;
            }
        };

        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let _ = ready_tx
                    .send(Err(daemon_error("Failed to subscribe to events", response).await))
                    .await;
                return;
            }
            Err(e) => {
                let _ = ready_tx
                    .send(Err(anyhow::anyhow!("Failed to reach the daemon: {}", e)))
                    .await;
                return;
            }
        };

        let _ = ready_tx.send(Ok(())).await;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = event_tx.send(Err(anyhow::anyhow!(e)));
                    break;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                if let Some(event) = parse_data_line(&line) {
                    if event_tx.send(Ok(event)).is_err() {
                        return;
                    }
                }
            }
        }
    });

    let result = follow_connect(client, config, server_id, handler, &mut ready_rx, &mut event_rx).await;
    reader.abort();
    result
}

async fn follow_connect<H: ConnectEventHandler>(
    client: &Client,
    config: &DaemonClientConfig,
    server_id: &str,
    handler: &mut H,
    ready_rx: &mut tokio::sync::mpsc::Receiver<Result<()>>,
    event_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Result<StatusEvent>>,
) -> Result<()> {
    match tokio::time::timeout(Duration::from_secs(5), ready_rx.recv()).await {
        Ok(Some(Ok(()))) => {}
        Ok(Some(Err(e))) => return Err(e),
        Ok(None) | Err(_) => anyhow::bail!("Timed out waiting for the daemon event stream"),
    }

    let path = format!("/api/connect/{}", server_id);
    post(client, config, &path, None, "Failed to connect").await?;

    let settle = Duration::from_secs(3);
    let overall_timer = tokio::time::sleep(Duration::from_secs(60));
    let settle_timer = tokio::time::sleep(Duration::from_secs(3600));
    tokio::pin!(overall_timer);
    tokio::pin!(settle_timer);
    let mut settling = false;
    let mut seen_connecting = false;

    loop {
        tokio::select! {
            _ = &mut overall_timer => {
                anyhow::bail!("Timed out waiting for the tunnel to come up");
            }
            _ = &mut settle_timer, if settling => {
                let status = get_status(client, config).await?;
                match status.status {
                    TunnelStatus::Connected
                        if status.server.as_ref().map_or(true, |server| server.id == server_id) =>
                    {
                        handler.on_connected(status.server.as_ref());
                        return Ok(());
                    }
                    TunnelStatus::Connected => {
                        anyhow::bail!("Another request took over the tunnel");
                    }
                    TunnelStatus::NotRunning => {
                        anyhow::bail!("The tunnel could not be brought up, check the daemon log");
                    }
                    TunnelStatus::Connecting | TunnelStatus::Disconnecting => settling = false,
                }
            }
            maybe_event = event_rx.recv() => {
                match maybe_event {
                    Some(Ok(StatusEvent::Status { status, server, .. })) => {
                        let other_server = server
                            .as_ref()
                            .filter(|server| server.id != server_id)
                            .map(|server| server.id.clone());
                        match status {
                            TunnelStatus::Connected => match other_server {
                                // State from before the request, e.g. the tunnel being switched away from
                                Some(_) if !seen_connecting => continue,
                                Some(other) => {
                                    anyhow::bail!("Another request connected to {} instead", other);
                                }
                                None => {
                                    handler.on_status(status, server.as_ref());
                                    handler.on_connected(server.as_ref());
                                    return Ok(());
                                }
                            },
                            TunnelStatus::NotRunning => {
                                settling = true;
                                settle_timer.as_mut().reset(tokio::time::Instant::now() + settle);
                            }
                            TunnelStatus::Disconnecting if seen_connecting => {
                                anyhow::bail!("The connection was cancelled");
                            }
                            TunnelStatus::Disconnecting => {}
                            TunnelStatus::Connecting => {
                                seen_connecting = true;
                                settling = false;
                            }
                        }
                        handler.on_status(status, server.as_ref());
                    }
                    Some(Ok(StatusEvent::Heartbeat { .. })) => {}
                    Some(Err(e)) => tracing::warn!("Event stream error: {}", e),
                    None => {
                        // Stream ended; reconcile once, then fail
                        let status = get_status(client, config).await?;
                        let on_target = status.server.as_ref().map_or(true, |server| server.id == server_id);
                        if status.status == TunnelStatus::Connected && on_target {
                            handler.on_connected(status.server.as_ref());
                            return Ok(());
                        }
                        anyhow::bail!("Event stream closed before the tunnel came up");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonClientConfig::default();
        assert_eq!(config.connection_mode, ConnectionMode::UnixSocket);
        assert_eq!(config.daemon_host, "127.0.0.1");
        assert_eq!(config.daemon_port, 4711);
    }

    #[test]
    fn test_daemon_base_url() {
        let mut config = DaemonClientConfig::default();
        assert_eq!(config.daemon_base_url().unwrap(), "http://daemon");

        config.connection_mode = ConnectionMode::Http;
        assert_eq!(config.daemon_base_url().unwrap(), "http://127.0.0.1:4711");

        config.daemon_host = "::1".to_string();
        assert_eq!(config.daemon_base_url().unwrap(), "http://[::1]:4711");

        config.daemon_host = String::new();
        assert!(config.daemon_base_url().is_err());
    }

    #[test]
    fn test_socket_path_override() {
        let config = DaemonClientConfig {
            daemon_url: "/tmp/custom/dicyvpn.sock".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.socket_path().unwrap(),
            PathBuf::from("/tmp/custom/dicyvpn.sock")
        );
    }

    #[test]
    fn test_user_socket_path() {
        assert_eq!(
            user_socket_path(Path::new("/run/user/1000")),
            PathBuf::from("/run/user/1000/dicyvpn/dicyvpn.sock")
        );
        assert_eq!(
            user_socket_path(Path::new("/run/user/1000/dicyvpn")),
            PathBuf::from("/run/user/1000/dicyvpn/dicyvpn.sock")
        );
    }

    #[test]
    fn test_connection_mode_toml() {
        let config: DaemonClientConfig = toml::from_str("connection_mode = \"http\"\ndaemon_port = 9000").unwrap();
        assert_eq!(config.connection_mode, ConnectionMode::Http);
        assert_eq!(config.daemon_port, 9000);
        assert!(config.auth_token.is_empty());
    }

    #[test]
    fn test_add_auth_header() {
        let client = Client::new();

        let config = DaemonClientConfig::default();
        let request = add_auth_header(client.get("http://test"), &config)
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get(DAEMON_TOKEN_HEADER).is_none());

        let config = DaemonClientConfig {
            auth_token: "test-token-123".to_string(),
            ..Default::default()
        };
        let request = add_auth_header(client.get("http://test"), &config)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get(DAEMON_TOKEN_HEADER).unwrap(),
            "test-token-123"
        );
    }
}
