// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// Tunnel backend
// Drives the WireGuard interface through wg-quick and reports up/down transitions

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dicyvpn_common::InterfaceState;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration keys only understood by mobile WireGuard backends
const UNSUPPORTED_KEYS: &[&str] = &["ExcludedApplications", "IncludedApplications"];

/// Receives interface transitions from a backend
pub trait TunnelStateListener: Send + Sync {
    fn on_state_change(&self, state: InterfaceState);
}

/// Imperative tunnel control
///
/// Both calls return immediately. Completion is only reported through the
/// [`TunnelStateListener`] the backend was created with.
pub trait TunnelBackend: Send + Sync {
    fn bring_up(&self, config: String);
    fn bring_down(&self);
}

enum BackendCommand {
    Up(String),
    Down,
}

// The config text carries the private key, keep it out of debug logs
impl std::fmt::Debug for BackendCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendCommand::Up(_) => f.write_str("Up"),
            BackendCommand::Down => f.write_str("Down"),
        }
    }
}

/// Settings for the wg-quick backend
#[derive(Debug, Clone)]
pub struct WgQuickSettings {
    pub wg_quick_path: PathBuf,
    pub interface_name: String,
    /// Directory holding the generated `<interface>.conf`
    pub config_dir: PathBuf,
}

impl WgQuickSettings {
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface_name))
    }
}

/// wg-quick backed tunnel
///
/// One actor task owns the interface and handles commands in the order they
/// were issued, so a bring-down and the following bring-up never overlap.
pub struct WgQuickBackend {
    tx: mpsc::UnboundedSender<BackendCommand>,
}

impl WgQuickBackend {
    /// Start the actor task
    pub fn spawn(
        settings: WgQuickSettings,
        listener: Arc<dyn TunnelStateListener>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            settings,
            listener,
            is_up: false,
        };
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx }, handle)
    }

    fn send(&self, command: BackendCommand) {
        if self.tx.send(command).is_err() {
            error!("Tunnel backend task is gone, dropping command");
        }
    }
}

impl TunnelBackend for WgQuickBackend {
    fn bring_up(&self, config: String) {
        self.send(BackendCommand::Up(config));
    }

    fn bring_down(&self) {
        self.send(BackendCommand::Down);
    }
}

struct Worker {
    settings: WgQuickSettings,
    listener: Arc<dyn TunnelStateListener>,
    is_up: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BackendCommand>) {
        self.clean_stale_interface().await;

        while let Some(command) = rx.recv().await {
            debug!("Tunnel backend command: {:?}", command);
            match command {
                BackendCommand::Up(config) => self.up(config).await,
                BackendCommand::Down => self.down().await,
            }
        }

        debug!("Tunnel backend channel closed, stopping");
    }

    /// A config file left behind means a previous daemon crashed with the interface up
    async fn clean_stale_interface(&mut self) {
        let path = self.settings.config_path();
        if !path.exists() {
            return;
        }

        warn!("Found stale tunnel config at {}, bringing it down", path.display());
        if let Err(e) = self.wg_quick("down", &path).await {
            debug!("Stale interface cleanup: {}", e);
        }
        remove_config(&path).await;
    }

    async fn up(&mut self, config: String) {
        let path = self.settings.config_path();

        if self.is_up {
            warn!("Interface already up, replacing it");
            if let Err(e) = self.wg_quick("down", &path).await {
                error!("Failed to bring down previous interface: {:#}", e);
            }
            self.is_up = false;
        }

        let result = async {
            write_config(&path, &strip_unsupported_keys(&config)).await?;
            self.wg_quick("up", &path).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Interface {} is up", self.settings.interface_name);
                self.is_up = true;
                self.listener.on_state_change(InterfaceState::Up);
            }
            Err(e) => {
                error!("Failed to bring up {}: {:#}", self.settings.interface_name, e);
                remove_config(&path).await;
                self.listener.on_state_change(InterfaceState::Down);
            }
        }
    }

    async fn down(&mut self) {
        if !self.is_up {
            debug!("Interface already down, nothing to do");
            return;
        }

        let path = self.settings.config_path();
        if let Err(e) = self.wg_quick("down", &path).await {
            error!("Failed to bring down {}: {:#}", self.settings.interface_name, e);
        }
        remove_config(&path).await;

        info!("Interface {} is down", self.settings.interface_name);
        self.is_up = false;
        self.listener.on_state_change(InterfaceState::Down);
    }

    async fn wg_quick(&self, action: &str, config_path: &Path) -> Result<()> {
        let output = Command::new(&self.settings.wg_quick_path)
            .arg(action)
            .arg(config_path)
            .output()
            .await
            .with_context(|| {
                format!("Failed to run {}", self.settings.wg_quick_path.display())
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("wg-quick {} exited with {}: {}", action, output.status, stderr.trim());
        }
        Ok(())
    }
}

/// Drop configuration keys wg-quick rejects
pub fn strip_unsupported_keys(config: &str) -> String {
    config
        .lines()
        .filter(|line| {
            let key = line.split('=').next().unwrap_or_default().trim();
            !UNSUPPORTED_KEYS.contains(&key)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn write_config(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create tunnel config directory")?;
    }

    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .context("Failed to set tunnel config permissions")?;
    }

    Ok(())
}

async fn remove_config(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingListener {
        states: Mutex<Vec<InterfaceState>>,
    }

    impl TunnelStateListener for RecordingListener {
        fn on_state_change(&self, state: InterfaceState) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn settings(dir: &TempDir, wg_quick: &str) -> WgQuickSettings {
        WgQuickSettings {
            wg_quick_path: PathBuf::from(wg_quick),
            interface_name: "dicyvpn0".to_string(),
            config_dir: dir.path().to_path_buf(),
        }
    }

    async fn wait_for_states(listener: &RecordingListener, count: usize) -> Vec<InterfaceState> {
        for _ in 0..100 {
            {
                let states = listener.states.lock().unwrap();
                if states.len() >= count {
                    return states.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        listener.states.lock().unwrap().clone()
    }

    #[test]
    fn test_strip_unsupported_keys() {
        let config = "[Interface]\nPrivateKey = k\nExcludedApplications = dicyvpn\n\n[Peer]\nPublicKey = p";
        assert_eq!(
            strip_unsupported_keys(config),
            "[Interface]\nPrivateKey = k\n\n[Peer]\nPublicKey = p"
        );
    }

    #[test]
    fn test_config_path() {
        let settings = WgQuickSettings {
            wg_quick_path: PathBuf::from("wg-quick"),
            interface_name: "dicyvpn0".to_string(),
            config_dir: PathBuf::from("/run/dicyvpn"),
        };
        assert_eq!(settings.config_path(), PathBuf::from("/run/dicyvpn/dicyvpn0.conf"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_up_and_down_with_successful_command() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(RecordingListener::default());
        let (backend, _task) = WgQuickBackend::spawn(settings(&dir, "true"), listener.clone());

        backend.bring_up("[Interface]\nExcludedApplications = x\nPrivateKey = k".to_string());
        let states = wait_for_states(&listener, 1).await;
        assert_eq!(states, vec![InterfaceState::Up]);

        let written = std::fs::read_to_string(dir.path().join("dicyvpn0.conf")).unwrap();
        assert!(!written.contains("ExcludedApplications"));

        backend.bring_down();
        let states = wait_for_states(&listener, 2).await;
        assert_eq!(states, vec![InterfaceState::Up, InterfaceState::Down]);
        assert!(!dir.path().join("dicyvpn0.conf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_up_reports_down() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(RecordingListener::default());
        let (backend, _task) = WgQuickBackend::spawn(settings(&dir, "false"), listener.clone());

        backend.bring_up("[Interface]".to_string());
        let states = wait_for_states(&listener, 1).await;
        assert_eq!(states, vec![InterfaceState::Down]);
    }

    #[tokio::test]
    async fn test_down_while_down_reports_nothing() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(RecordingListener::default());
        let (backend, _task) = WgQuickBackend::spawn(settings(&dir, "true"), listener.clone());

        backend.bring_down();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(listener.states.lock().unwrap().is_empty());
    }
}
