// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// DicyVPN - Daemon
// Core service owning the VPN tunnel

mod api;
mod auth;
mod backend;
mod config;
mod coordinator;
mod manager;
mod observer;
mod permissions;
mod pidfile;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use dicyvpn_common::credentials::CredentialStore;
use dicyvpn_common::last_server::last_server_path;
use dicyvpn_common::{default_store, ApiClient, RemoteService};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use backend::{WgQuickBackend, WgQuickSettings};
use config::{DaemonConfig, ListenerMode};
use coordinator::ConnectionCoordinator;
use manager::VpnManager;
use observer::TunnelStateObserver;

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dicyvpn_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("DicyVPN Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Build: {} ({})",
        option_env!("BUILD_DATE").unwrap_or("unknown"),
        option_env!("GIT_HASH").unwrap_or("unknown")
    );

    // Load daemon configuration
    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);
    info!("Authentication required: {}", daemon_config.require_auth);

    let runtime_dir = config::runtime_dir();
    permissions::ensure_directory_with_permissions(&runtime_dir, daemon_config.group_access)?;

    // Create PID file to prevent multiple instances
    let _pid_guard = pidfile::PidFileGuard::create(&runtime_dir)
        .context("Failed to create PID file - another daemon may already be running")?;

    // Load or generate authentication token if required
    let (auth_token, token_was_generated) = if daemon_config.require_auth {
        let (token, was_new) = auth::load_or_generate_token(&daemon_config.auth_token_path)?;
        (Some(token), was_new)
    } else {
        info!("Authentication disabled - API endpoints are publicly accessible");
        (None, false)
    };

    if token_was_generated {
        config::write_cli_config_snippet(
            &daemon_config.listener_mode,
            &daemon_config.bind_host,
            daemon_config.bind_port,
            auth_token.as_deref(),
        )?;
    }

    let manager = Arc::new(build_manager(&daemon_config, &runtime_dir)?);

    // Log status transitions
    let mut status_rx = manager.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            info!("Tunnel status: {}", status);
        }
    });

    // Create shutdown broadcast channel for graceful SSE stream termination
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    // Create shared state
    let state = Arc::new(AppState {
        manager: manager.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });

    // Create API router with optional authentication
    let app = if let Some(token) = auth_token {
        let auth_state = auth::AuthState::new(token);
        create_router(state)
            .layer(axum::middleware::from_fn_with_state(
                auth_state,
                auth::auth_middleware,
            ))
    } else {
        create_router(state)
    };
    let app = app.layer(tower_http::trace::TraceLayer::new_for_http());

    // Start listener based on configured mode
    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, &daemon_config, manager, shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            let bind_address =
                dicyvpn_common::format_host_port(&daemon_config.bind_host, daemon_config.bind_port);
            serve_tcp_http(app, &bind_address, manager, shutdown_tx).await?;
        }
    }

    info!("Daemon shut down");
    Ok(())
}

/// Wire the VPN service client, tunnel backend and observer together
fn build_manager(daemon_config: &DaemonConfig, runtime_dir: &std::path::Path) -> Result<VpnManager> {
    let credentials: Arc<dyn CredentialStore> =
        Arc::from(default_store().context("Failed to open credential storage")?);
    let remote: Arc<dyn RemoteService> = Arc::new(
        ApiClient::new(&daemon_config.api_config(), credentials.clone())
            .context("Failed to create VPN service client")?,
    );
    info!("VPN service: {}", daemon_config.api_base_url);

    let observer = Arc::new(TunnelStateObserver::new());
    let (backend, _backend_task) = WgQuickBackend::spawn(
        WgQuickSettings {
            wg_quick_path: daemon_config.wg_quick_path.clone(),
            interface_name: daemon_config.interface_name.clone(),
            config_dir: runtime_dir.to_path_buf(),
        },
        observer.clone(),
    );
    info!("Tunnel interface: {}", daemon_config.interface_name);

    let coordinator = ConnectionCoordinator::new(
        remote.clone(),
        Arc::new(backend),
        observer.clone(),
        credentials,
        daemon_config.tunnel_settings(),
    );

    let last_server = match last_server_path() {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Last server will not be remembered: {:#}", e);
            None
        }
    };

    Ok(VpnManager::new(remote, coordinator, observer, last_server))
}

/// Serve on Unix domain socket (local-only)
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    manager: Arc<VpnManager>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = config::socket_path();

    // Remove existing socket file if it exists
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    // Create parent directory with appropriate permissions
    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    // Bind to Unix socket
    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    // Set socket permissions immediately after binding
    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    // Set up shutdown signal
    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(manager).await;
        // Signal SSE streams to close
        let _ = shutdown_broadcast.send(());
        // Signal server to stop accepting connections
        let _ = shutdown_signal_tx.send(()).await;
    });

    // Accept connections
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // Clients closing an event stream is normal
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    // Cleanup socket
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on TCP with HTTP (loopback-only, no TLS)
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    manager: Arc<VpnManager>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("WARNING: HTTP mode has no encryption - use only on localhost!");
    info!("Daemon started successfully");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager, shutdown_tx))
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(
    manager: Arc<VpnManager>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) {
    wait_for_shutdown(manager).await;
    // Signal all SSE streams to close
    let _ = shutdown_tx.send(());
}

/// Wait for Ctrl+C or SIGTERM, then bring the tunnel down
async fn wait_for_shutdown(manager: Arc<VpnManager>) {
    #[cfg(unix)]
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
            };
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    manager.shutdown().await;
    info!("Tunnel stopped");
}
