// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// Credential storage - account tokens and the issued WireGuard private key

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use keyring::Entry;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
pub const AUTH_REFRESH_TOKEN_HEADER: &str = "X-Auth-Refresh-Token";
pub const AUTH_PRIVATE_KEY_HEADER: &str = "X-Auth-Private-Key";

const KEYRING_SERVICE: &str = "dicyvpn";
const KEYRING_USER: &str = "auth";

/// Authentication material for one logged-in device
#[derive(Clone)]
pub struct AuthInfo {
    pub token: Zeroizing<String>,
    pub refresh_token: Zeroizing<String>,
    pub refresh_token_id: String,
    pub account_id: String,
    /// WireGuard private key issued at login
    pub private_key: Zeroizing<String>,
}

// Manual Debug impl since the secrets must never be printed
impl std::fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInfo")
            .field("token", &obfuscate_token(&self.token))
            .field("refresh_token_id", &self.refresh_token_id)
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// On-disk/keyring representation
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAuth {
    token: String,
    refresh_token: String,
    refresh_token_id: String,
    account_id: String,
    private_key: String,
}

impl From<&AuthInfo> for StoredAuth {
    fn from(info: &AuthInfo) -> Self {
        Self {
            token: info.token.to_string(),
            refresh_token: info.refresh_token.to_string(),
            refresh_token_id: info.refresh_token_id.clone(),
            account_id: info.account_id.clone(),
            private_key: info.private_key.to_string(),
        }
    }
}

impl From<StoredAuth> for AuthInfo {
    fn from(stored: StoredAuth) -> Self {
        Self {
            token: Zeroizing::new(stored.token),
            refresh_token: Zeroizing::new(stored.refresh_token),
            refresh_token_id: stored.refresh_token_id,
            account_id: stored.account_id,
            private_key: Zeroizing::new(stored.private_key),
        }
    }
}

/// Claims we need from the access token payload
#[derive(Deserialize)]
struct TokenClaims {
    #[serde(rename = "refreshTokenId")]
    refresh_token_id: String,
    #[serde(rename = "_id")]
    account_id: String,
}

impl AuthInfo {
    /// Build auth info from the headers of a successful login response
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let token = required_header(headers, AUTH_TOKEN_HEADER)?;
        let refresh_token = required_header(headers, AUTH_REFRESH_TOKEN_HEADER)?;
        let private_key = required_header(headers, AUTH_PRIVATE_KEY_HEADER)?;
        let claims = decode_token_claims(&token)?;

        Ok(Self {
            token: Zeroizing::new(token),
            refresh_token: Zeroizing::new(refresh_token),
            refresh_token_id: claims.refresh_token_id,
            account_id: claims.account_id,
            private_key: Zeroizing::new(private_key),
        })
    }
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::Credentials(format!("missing {} header in response", name)))
}

fn decode_token_claims(token: &str) -> Result<TokenClaims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Credentials("access token is not a JWT".to_string()))?;

    let trimmed = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(payload))
        .map_err(|e| Error::Credentials(format!("invalid token payload encoding: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Credentials(format!("invalid token payload: {}", e)))
}

/// Obfuscate a token for logging (show only last 4 characters)
pub fn obfuscate_token(token: &str) -> String {
    let len = token.chars().count();
    if len < 4 {
        "*".repeat(len)
    } else {
        let tail: String = token.chars().skip(len - 4).collect();
        format!("{}{}", "*".repeat(len - 4), tail)
    }
}

/// Storage for the account credentials
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<AuthInfo>>;

    fn save(&self, info: &AuthInfo) -> Result<()>;

    /// Remove every stored credential. Idempotent.
    fn clear(&self) -> Result<()>;

    /// Replace the access token after a refresh
    fn set_token(&self, token: &str) -> Result<()> {
        let mut info = self.load()?.ok_or(Error::NotLoggedIn)?;
        info.token = Zeroizing::new(token.to_string());
        self.save(&info)
    }

    /// The WireGuard private key issued at login
    fn private_key(&self) -> Result<Zeroizing<String>> {
        self.load()?
            .map(|info| info.private_key)
            .ok_or(Error::NotLoggedIn)
    }
}

/// Credentials kept in the system keychain as one JSON entry
pub struct KeyringCredentialStore {
    entry: Entry,
}

impl KeyringCredentialStore {
    pub fn new() -> Result<Self> {
        let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
            .map_err(|e| Error::Keychain(format!("Failed to create keychain entry: {}", e)))?;
        Ok(Self { entry })
    }

    /// Check the keychain can be read (an empty entry counts as usable)
    pub fn is_available(&self) -> bool {
        match self.entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => true,
            Err(e) => {
                debug!("Keychain not usable: {}", e);
                false
            }
        }
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self) -> Result<Option<AuthInfo>> {
        match self.entry.get_password() {
            Ok(json) => {
                let json = Zeroizing::new(json);
                let stored: StoredAuth = serde_json::from_str(&json)?;
                Ok(Some(stored.into()))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Keychain(format!(
                "Failed to retrieve credentials from keychain: {}",
                e
            ))),
        }
    }

    fn save(&self, info: &AuthInfo) -> Result<()> {
        let json = Zeroizing::new(serde_json::to_string(&StoredAuth::from(info))?);
        self.entry
            .set_password(&json)
            .map_err(|e| Error::Keychain(format!("Failed to store credentials in keychain: {}", e)))
    }

    fn clear(&self) -> Result<()> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Keychain(format!(
                "Failed to remove credentials from keychain: {}",
                e
            ))),
        }
    }
}

/// Credentials kept in a JSON file readable only by the owner
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location: ~/.config/dicyvpn/credentials.json
    pub fn default_path() -> Result<PathBuf> {
        Ok(crate::config::config_dir()?.join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<AuthInfo>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = Zeroizing::new(fs::read_to_string(&self.path)?);
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let stored: StoredAuth = serde_json::from_str(&contents)?;
        Ok(Some(stored.into()))
    }

    fn save(&self, info: &AuthInfo) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = Zeroizing::new(serde_json::to_string_pretty(&StoredAuth::from(info))?);
        fs::write(&self.path, json.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory credentials, used by tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Option<AuthInfo>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(info: AuthInfo) -> Self {
        Self {
            inner: Mutex::new(Some(info)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<AuthInfo>> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| Error::Credentials("credential store poisoned".to_string()))?
            .clone())
    }

    fn save(&self, info: &AuthInfo) -> Result<()> {
        *self
            .inner
            .lock()
            .map_err(|_| Error::Credentials("credential store poisoned".to_string()))? =
            Some(info.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self
            .inner
            .lock()
            .map_err(|_| Error::Credentials("credential store poisoned".to_string()))? = None;
        Ok(())
    }
}

/// Check if keyring use is disabled through DICYVPN_SKIP_KEYRING
fn should_skip_keyring() -> bool {
    if let Ok(val) = std::env::var("DICYVPN_SKIP_KEYRING") {
        matches!(val.as_str(), "1" | "true" | "True" | "TRUE")
    } else {
        false
    }
}

/// Pick the keychain when it works, a private file otherwise
pub fn default_store() -> Result<Box<dyn CredentialStore>> {
    if !should_skip_keyring() {
        match KeyringCredentialStore::new() {
            Ok(store) if store.is_available() => {
                info!("Using system keychain for credentials");
                return Ok(Box::new(store));
            }
            Ok(_) => warn!("System keychain unavailable, falling back to file storage"),
            Err(e) => warn!("{}, falling back to file storage", e),
        }
    }

    let path = FileCredentialStore::default_path()?;
    info!("Using credential file: {}", path.display());
    Ok(Box::new(FileCredentialStore::new(path)))
}
