// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// Remote VPN service client
// Server catalog, session issuance, disconnect accounting and account login

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ApiConfig;
use crate::credentials::{obfuscate_token, AuthInfo, CredentialStore, AUTH_TOKEN_HEADER};
use crate::error::{Error, Result};
use crate::types::{ConnectionRequest, ConnectionSession, Server, ServerList};

/// Remote code returned when the account has no active subscription
pub const NO_SUBSCRIPTION_CODE: &str = "NO_SUBSCRIPTION";

/// Remote code returned when the account has too many registered devices
pub const DEVICES_LIMIT_REACHED_CODE: &str = "DEVICES_LIMIT_REACHED";

const MIN_PASSWORD_LENGTH: usize = 8;

/// Operations the connection logic needs from the VPN service
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetch the server catalog
    async fn list_servers(&self) -> Result<ServerList>;

    /// Ask the service for a new session on `server`
    async fn connect(&self, server: &Server) -> Result<ConnectionSession>;

    /// Tell the service we left `server` (best-effort accounting)
    async fn disconnect(&self, server: &Server) -> Result<()>;

    /// Log in and persist the returned credentials
    async fn login(&self, email: &str, password: &str) -> Result<AuthInfo>;

    /// Log out and forget the stored credentials
    async fn logout(&self) -> Result<()>;
}

/// Structured error body: `{"reply": {"code": .., "message": ..}}`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: String,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    reply: ErrorReply,
}

#[derive(Deserialize)]
struct MessageBody {
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublicLoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    is_device: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokenRequest<'a> {
    refresh_token: &'a str,
    refresh_token_id: &'a str,
    account_id: &'a str,
}

/// Parse a structured error body, `None` if it is not one
pub fn parse_error_reply(body: &str) -> Option<ErrorReply> {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|envelope| envelope.reply)
}

/// Map a failed connect response body to an error
pub fn connect_error(body: &str) -> Error {
    match parse_error_reply(body) {
        Some(reply) if reply.code == NO_SUBSCRIPTION_CODE => Error::NoSubscription,
        Some(reply) => Error::Remote(reply.message),
        None => Error::UnparseableResponse(body.to_string()),
    }
}

/// Map a failed login response to an error
pub fn login_error(status: StatusCode, body: &str) -> Error {
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
        return Error::InvalidCredentials;
    }

    match parse_error_reply(body) {
        Some(reply) if reply.code == NO_SUBSCRIPTION_CODE => Error::NoSubscription,
        Some(reply) if reply.code == DEVICES_LIMIT_REACHED_CODE => Error::DevicesLimitReached,
        Some(reply) => Error::Remote(reply.message),
        None => Error::UnparseableResponse(body.to_string()),
    }
}

/// Check login input before sending it anywhere
pub fn validate_login(email: &str, password: &str) -> Result<()> {
    if !is_plausible_email(email) {
        return Err(Error::InvalidInput("Invalid email address".to_string()));
    }
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Password must be at least {} characters long",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// User agent sent with every request
pub fn user_agent() -> String {
    format!(
        "DicyVPN/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// HTTP client for the VPN service
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        config.validate()?;

        let user_agent = user_agent();
        info!("Creating API client ({})", user_agent);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// URL of an authenticated endpoint
    pub fn api_url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    /// URL of a public (unauthenticated) endpoint
    pub fn public_url(&self, path: &str) -> String {
        format!("{}/v1/public/{}", self.base_url, path)
    }

    /// Send an authenticated request, refreshing the token once on 401
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let info = self.credentials.load()?.ok_or(Error::NotLoggedIn)?;
        let response = build(&self.client)
            .bearer_auth(info.token.as_str())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!("Token has expired, refreshing");
        let token = match self.refresh_token(&info).await? {
            Some(token) => token,
            None => return Err(Error::Unauthorized),
        };

        info!("Token has been refreshed, retrying request");
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized);
        }
        Ok(response)
    }

    /// Exchange the refresh token for a new access token
    ///
    /// Returns `None` (and forgets the stored credentials) when the service
    /// refuses the refresh.
    async fn refresh_token(&self, info: &AuthInfo) -> Result<Option<String>> {
        let request = RefreshTokenRequest {
            refresh_token: info.refresh_token.as_str(),
            refresh_token_id: &info.refresh_token_id,
            account_id: &info.account_id,
        };

        let response = self
            .client
            .post(self.public_url("refresh-token"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            error!(
                "Failed to refresh token ({}), logging out",
                response.status()
            );
            self.credentials.clear()?;
            return Ok(None);
        }

        let token = response
            .headers()
            .get(AUTH_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Credentials(format!("missing {} header in refresh response", AUTH_TOKEN_HEADER))
            })?;

        self.credentials.set_token(&token)?;
        debug!("Stored refreshed token {}", obfuscate_token(&token));
        Ok(Some(token))
    }
}

#[async_trait]
impl RemoteService for ApiClient {
    async fn list_servers(&self) -> Result<ServerList> {
        let url = self.api_url("servers/list");
        let response = self.send_authorized(|client| client.get(&url)).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Failed to get servers list: {} - {}", status, body);
            return Err(match parse_error_reply(&body) {
                Some(reply) => Error::Remote(reply.message),
                None => Error::UnparseableResponse(body),
            });
        }

        Ok(response.json().await?)
    }

    async fn connect(&self, server: &Server) -> Result<ConnectionSession> {
        let url = self.api_url(&format!("servers/connect/{}", server.id));
        let request = ConnectionRequest::wireguard(server);
        let response = self
            .send_authorized(|client| client.post(&url).json(&request))
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(connect_error(&body));
        }

        Ok(response.json().await?)
    }

    async fn disconnect(&self, server: &Server) -> Result<()> {
        let url = self.api_url(&format!("servers/disconnect/{}", server.id));
        let request = ConnectionRequest::wireguard(server);
        let response = self
            .send_authorized(|client| client.post(&url).json(&request))
            .await?;

        if !response.status().is_success() {
            return Err(Error::Remote(format!(
                "disconnect request for {} returned {}",
                server.id,
                response.status()
            )));
        }

        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> Result<AuthInfo> {
        validate_login(email, password)?;

        let request = PublicLoginRequest {
            email,
            password,
            is_device: true,
        };
        let response = self
            .client
            .post(self.public_url("login"))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(login_error(status, &body));
        }

        let info = AuthInfo::from_headers(response.headers())?;
        self.credentials.save(&info)?;
        info!("Logged in, accountId: {}", info.account_id);
        Ok(info)
    }

    async fn logout(&self) -> Result<()> {
        let url = self.api_url("logout");
        let result = self.send_authorized(|client| client.get(&url)).await;

        // Without any answer the session may still be live remotely; keep it
        if let Err(Error::Http(e)) = result {
            return Err(Error::Http(e));
        }

        // Local credentials go away whatever the service answered
        self.credentials.clear()?;

        match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<MessageBody>(&body)
                    .map(|m| m.message)
                    .unwrap_or(body);
                warn!("Logout request failed: {}", message);
                Ok(())
            }
            Err(Error::NotLoggedIn) | Err(Error::Unauthorized) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
