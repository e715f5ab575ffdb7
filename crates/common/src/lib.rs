// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// DicyVPN - Common Library
// Shared types, the VPN service client, credential storage and daemon client

pub mod api;
pub mod config;
pub mod credentials;
pub mod daemon_client;
pub mod error;
pub mod last_server;
pub mod network;
pub mod sse;
pub mod types;
pub mod wireguard;

pub use api::{ApiClient, RemoteService};
pub use config::{config_dir, ApiConfig, TunnelSettings, APP_DIR_NAME};
pub use credentials::{default_store, AuthInfo, CredentialStore};
pub use daemon_client::{
    add_auth_header, connect_with_events, create_daemon_client, ConnectEventHandler,
    ConnectionMode, DaemonClientConfig,
};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address};
pub use sse::EventListener;
pub use types::{
    ConnectionRequest, ConnectionSession, InterfaceState, LoginRequest, Server, ServerList,
    ServerTier, StatusEvent, StatusResponse, TunnelStatus,
};
pub use wireguard::render_config;

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
