// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

// DicyVPN - Authentication Module
// Handles token-based authentication for the daemon API

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dicyvpn_common::credentials::obfuscate_token;
use dicyvpn_common::daemon_client::{DAEMON_AUTH_SCHEME, DAEMON_TOKEN_HEADER};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Generate a new authentication token
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Load or generate authentication token from file
/// Returns (token, was_newly_generated)
pub fn load_or_generate_token(token_path: &Path) -> Result<(String, bool)> {
    if token_path.exists() {
        let token = fs::read_to_string(token_path)
            .context("Failed to read authentication token file")?
            .trim()
            .to_string();

        if token.is_empty() {
            warn!("Token file exists but is empty, regenerating");
        } else {
            info!("Loaded authentication token from: {}", token_path.display());
            return Ok((token, false));
        }
    }

    let token = generate_token();
    save_token(token_path, &token)?;

    info!("Generated new authentication token");
    info!("Token saved to: {}", token_path.display());
    info!("");
    info!("IMPORTANT: Clients must provide this token to connect!");
    info!("   Token: {} (full token in {})", obfuscate_token(&token), token_path.display());
    info!("   Add it to the CLI config or send it in the {} header", DAEMON_TOKEN_HEADER);

    Ok((token, true))
}

/// Save authentication token to file
fn save_token(token_path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = token_path.parent() {
        fs::create_dir_all(parent).context("Failed to create token directory")?;
    }

    fs::write(token_path, token).context("Failed to write token file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(0o600);
        fs::set_permissions(token_path, permissions)
            .context("Failed to set token file permissions")?;
    }

    Ok(())
}

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    token: Zeroizing<String>,
}

impl AuthState {
    pub fn new(token: String) -> Self {
        Self {
            token: Zeroizing::new(token),
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, DAEMON_AUTH_SCHEME)],
    )
        .into_response()
}

/// Authentication middleware for Axum
///
/// Checks the X-Daemon-Token header against the configured token. Rejections
/// carry `WWW-Authenticate: daemon-token` so clients can tell them apart from
/// VPN service login failures.
pub async fn auth_middleware(
    axum::extract::State(auth_state): axum::extract::State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let provided_token = request
        .headers()
        .get(DAEMON_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    match provided_token {
        Some(token) if token == auth_state.token.as_str() => {
            // Clients poll frequently; keep at trace
            tracing::trace!("Authentication successful");
            next.run(request).await
        }
        Some(_) => {
            warn!("Authentication failed: invalid token");
            unauthorized()
        }
        None => {
            warn!("Authentication failed: missing token");
            unauthorized()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[test]
    fn test_generate_token() {
        let token = generate_token();
        assert!(Uuid::parse_str(&token).is_ok());
    }

    #[test]
    fn test_save_and_load_token() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(!token.is_empty());
        assert!(was_new);

        let (loaded_token, was_new2) = load_or_generate_token(&token_path).unwrap();
        assert_eq!(token, loaded_token);
        assert!(!was_new2);
    }

    #[test]
    fn test_empty_token_file_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");
        fs::write(&token_path, "  \n").unwrap();

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(was_new);
        assert_eq!(fs::read_to_string(&token_path).unwrap(), token);
    }

    #[test]
    fn test_token_file_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");

        let (_token, _was_new) = load_or_generate_token(&token_path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(&token_path).unwrap();
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        }
    }

    fn protected_router() -> Router {
        Router::new()
            .route("/api/status", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                AuthState::new("secret".to_string()),
                auth_middleware,
            ))
    }

    #[tokio::test]
    async fn test_middleware_accepts_valid_token() {
        let request = Request::builder()
            .uri("/api/status")
            .header(DAEMON_TOKEN_HEADER, "secret")
            .body(Body::empty())
            .unwrap();
        let response = protected_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_rejects_missing_or_wrong_token() {
        for token in [None, Some("wrong")] {
            let mut builder = Request::builder().uri("/api/status");
            if let Some(token) = token {
                builder = builder.header(DAEMON_TOKEN_HEADER, token);
            }
            let response = protected_router()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
                DAEMON_AUTH_SCHEME
            );
        }
    }
}
