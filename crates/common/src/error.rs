// Error types for the DicyVPN client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    /// The account has no active subscription (remote code `NO_SUBSCRIPTION`)
    #[error("No active subscription")]
    NoSubscription,

    /// The account reached its device limit (remote code `DEVICES_LIMIT_REACHED`)
    #[error("Reached the maximum number of devices for this account")]
    DevicesLimitReached,

    #[error("Invalid email or password")]
    InvalidCredentials,

    /// Structured failure from the remote service, message kept as sent
    #[error("{0}")]
    Remote(String),

    /// Error body that could not be parsed, raw body kept for diagnostics
    #[error("Unknown error, please try again later\n\n{0}")]
    UnparseableResponse(String),

    #[error("Session expired, please log in again")]
    Unauthorized,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Invalid connection session: {0}")]
    Session(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
