// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// DicyVPN - VPN Manager
// Owns the current server selection and serializes connect/disconnect requests

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dicyvpn_common::last_server::{load_last_server, save_last_server};
use dicyvpn_common::{
    Error, RemoteService, Result, Server, ServerList, StatusResponse, TunnelStatus,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::ConnectionCoordinator;
use crate::observer::TunnelStateObserver;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Front door for every tunnel operation the API exposes
///
/// A new connect cancels the one in flight; connects and disconnects run one
/// at a time behind `operation_lock`.
pub struct VpnManager {
    remote: Arc<dyn RemoteService>,
    coordinator: ConnectionCoordinator,
    observer: Arc<TunnelStateObserver>,
    last_server_path: Option<PathBuf>,
    current: Mutex<Option<Server>>,
    catalog: Mutex<Option<ServerList>>,
    in_flight: Mutex<Option<CancellationToken>>,
    operation_lock: tokio::sync::Mutex<()>,
}

impl VpnManager {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        coordinator: ConnectionCoordinator,
        observer: Arc<TunnelStateObserver>,
        last_server_path: Option<PathBuf>,
    ) -> Self {
        let current = match last_server_path.as_deref().map(load_last_server) {
            Some(Ok(server)) => server,
            Some(Err(e)) => {
                warn!("Ignoring last server selection: {:#}", e);
                None
            }
            None => None,
        };
        if let Some(server) = &current {
            info!("Last used server: {} ({})", server.name, server.id);
        }

        Self {
            remote,
            coordinator,
            observer,
            last_server_path,
            current: Mutex::new(current),
            catalog: Mutex::new(None),
            in_flight: Mutex::new(None),
            operation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            status: self.observer.status(),
            server: self.current_server(),
        }
    }

    pub fn current_server(&self) -> Option<Server> {
        lock(&self.current).clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.observer.subscribe()
    }

    /// Fetch the server catalog and keep it for resolving connect requests
    pub async fn servers(&self) -> Result<ServerList> {
        let servers = self.remote.list_servers().await?;
        debug!("Fetched {} servers", servers.len());
        *lock(&self.catalog) = Some(servers.clone());
        Ok(servers)
    }

    async fn resolve(&self, server_id: &str) -> Result<Server> {
        let cached = lock(&self.catalog)
            .as_ref()
            .and_then(|catalog| catalog.find(server_id).cloned());
        if let Some(server) = cached {
            return Ok(server);
        }

        self.servers()
            .await?
            .find(server_id)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(server_id.to_string()))
    }

    /// Connect to `server_id`, switching away from the current server if needed
    ///
    /// Returns once the bring-up is scheduled. A later connect or disconnect
    /// cancels this one, including a bring-up still waiting for teardown.
    pub async fn connect(&self, server_id: &str) -> Result<Server> {
        let target = self.resolve(server_id).await?;

        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.in_flight).replace(token.clone()) {
            previous.cancel();
        }

        let _operation = self.operation_lock.lock().await;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Status events from here on name the target
        let previous = lock(&self.current).replace(target.clone());
        if let Err(e) = self
            .coordinator
            .connect(&target, previous.as_ref(), &token)
            .await
        {
            *lock(&self.current) = previous;
            return Err(e);
        }

        if let Some(path) = &self.last_server_path {
            if let Err(e) = save_last_server(path, &target) {
                warn!("Failed to remember last server: {:#}", e);
            }
        }

        Ok(target)
    }

    /// Disconnect the tunnel, cancelling any connect in progress
    pub async fn disconnect(&self) {
        // Remote accounting finishes in the background
        drop(self.stop_tunnel().await);
    }

    async fn stop_tunnel(&self) -> Option<JoinHandle<()>> {
        if let Some(token) = lock(&self.in_flight).take() {
            token.cancel();
        }

        let _operation = self.operation_lock.lock().await;
        let current = self.current_server();
        self.coordinator.stop(false, current.as_ref(), None)
    }

    /// Log in to the VPN service
    pub async fn login(&self, email: &str, password: &str) -> Result<()> {
        let auth = self.remote.login(email, password).await?;
        info!("Logged in as account {}", auth.account_id);
        Ok(())
    }

    /// Log out, tearing down a running tunnel first
    pub async fn logout(&self) -> Result<()> {
        if self.observer.status() != TunnelStatus::NotRunning {
            info!("Disconnecting before logout");
            if let Some(notification) = self.stop_tunnel().await {
                // The end-session call still needs the credentials
                let _ = notification.await;
            }
        }

        self.remote.logout().await?;
        *lock(&self.catalog) = None;
        info!("Logged out");
        Ok(())
    }

    /// Bring the tunnel down before the daemon exits
    pub async fn shutdown(&self) {
        if self.observer.status() == TunnelStatus::NotRunning {
            return;
        }

        info!("Shutting down the tunnel");
        let notification = self.stop_tunnel().await;
        let mut status = self.subscribe();

        let finished = tokio::time::timeout(SHUTDOWN_TIMEOUT, async move {
            if let Some(notification) = notification {
                let _ = notification.await;
            }
            let _ = status
                .wait_for(|status| *status == TunnelStatus::NotRunning)
                .await;
        })
        .await;

        if finished.is_err() {
            warn!("Tunnel did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
    }
}
