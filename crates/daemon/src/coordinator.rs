// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// Connection coordinator
// Sequences session issuance, teardown of the previous tunnel and bring-up of the next

use std::sync::Arc;

use dicyvpn_common::credentials::CredentialStore;
use dicyvpn_common::wireguard::{redact_private_key, render_config};
use dicyvpn_common::{
    Error, InterfaceState, RemoteService, Result, Server, TunnelSettings, TunnelStatus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::TunnelBackend;
use crate::observer::TunnelStateObserver;

/// Drives one connect-to-server transaction at a time
///
/// A bring-up is only ever issued from a stop callback, i.e. after the
/// observer has seen the previous interface go down.
pub struct ConnectionCoordinator {
    remote: Arc<dyn RemoteService>,
    backend: Arc<dyn TunnelBackend>,
    observer: Arc<TunnelStateObserver>,
    credentials: Arc<dyn CredentialStore>,
    settings: TunnelSettings,
}

impl ConnectionCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        backend: Arc<dyn TunnelBackend>,
        observer: Arc<TunnelStateObserver>,
        credentials: Arc<dyn CredentialStore>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            remote,
            backend,
            observer,
            credentials,
            settings,
        }
    }

    /// Connect to `target`, replacing the tunnel to `current` if there is one
    ///
    /// Returns once the bring-up is scheduled; the tunnel itself comes up
    /// asynchronously and is reported through the observer. Every error path
    /// rolls the published status back before returning.
    pub async fn connect(
        &self,
        target: &Server,
        current: Option<&Server>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.observer.set_status(TunnelStatus::Connecting);

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Connection to {} cancelled", target.id);
                self.roll_back();
                return Err(Error::Cancelled);
            }
            result = self.remote.connect(target) => result,
        };

        let session = match session {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to connect to {} ({}): {}", target.name, target.id, e);
                self.roll_back();
                return Err(e);
            }
        };
        debug!("Received session: {:?}", session);

        let config = match self.render(&session) {
            Ok(config) => config,
            Err(e) => {
                error!("Unusable session for {}: {}", target.id, e);
                self.roll_back();
                self.abandon_session(target);
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            info!("Connection to {} cancelled before teardown", target.id);
            self.roll_back();
            self.abandon_session(target);
            return Err(Error::Cancelled);
        }

        // The remote accounting call for `current` runs detached
        drop(self.stop(true, current, Some(target)));

        info!("Connecting to WireGuard server {} ({})", target.name, target.id);
        debug!("WireGuard config:\n{}", redact_private_key(&config));

        let backend = self.backend.clone();
        let observer = self.observer.clone();
        let cancel = cancel.clone();
        let target_id = target.id.clone();
        self.observer.wait_for_stopped(move || {
            if cancel.is_cancelled() {
                info!("Skipping bring-up for {}, connection was cancelled", target_id);
                return;
            }
            observer.set_status(TunnelStatus::Connecting);
            backend.bring_up(config);
        });

        Ok(())
    }

    /// Tear down the current tunnel
    ///
    /// `is_switching` marks an internal step of a connect, which keeps the
    /// status at connecting. The end-session notification for a primary
    /// `current` server runs in the background; its handle is returned so
    /// callers may wait for it.
    pub fn stop(
        &self,
        is_switching: bool,
        current: Option<&Server>,
        new: Option<&Server>,
    ) -> Option<JoinHandle<()>> {
        if self.observer.status() == TunnelStatus::NotRunning {
            debug!("Tunnel not running, nothing to stop");
            return None;
        }

        info!("Stopping VPN");
        if !is_switching {
            self.observer.set_status(TunnelStatus::Disconnecting);
        }

        let notification = match current {
            Some(server) if server.is_primary() && new.map_or(true, |n| n.id != server.id) => {
                info!("Disconnecting from the primary server");
                Some(self.end_session(server.clone()))
            }
            _ => None,
        };

        self.backend.bring_down();
        notification
    }

    fn render(&self, session: &dicyvpn_common::ConnectionSession) -> Result<String> {
        let private_key = self.credentials.private_key()?;
        render_config(session, &private_key, &self.settings)
    }

    /// Undo the connecting status after a failed attempt
    ///
    /// Nothing was torn down yet, so an interface that is still up keeps
    /// carrying traffic and is reported as connected.
    fn roll_back(&self) {
        let status = match self.observer.interface_state() {
            InterfaceState::Up => TunnelStatus::Connected,
            InterfaceState::Down => TunnelStatus::NotRunning,
        };
        self.observer.set_status(status);
    }

    /// Release a session that was issued but will never be used
    fn abandon_session(&self, target: &Server) {
        if target.is_primary() {
            drop(self.end_session(target.clone()));
        }
    }

    /// Fire-and-forget remote disconnect; failures are only logged
    fn end_session(&self, server: Server) -> JoinHandle<()> {
        let remote = self.remote.clone();
        tokio::spawn(async move {
            match remote.disconnect(&server).await {
                Ok(()) => info!(
                    "Sent disconnection request for {} ({})",
                    server.name, server.id
                ),
                Err(e) => error!(
                    "Failed to send disconnection request for {} ({}): {}",
                    server.name, server.id, e
                ),
            }
        })
    }
}
