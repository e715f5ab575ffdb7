// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

//! WireGuard configuration rendering
//!
//! Turns a [`ConnectionSession`] into the text block understood by the tunnel
//! backend's config parser. The output must stay byte-for-byte stable.

use crate::config::TunnelSettings;
use crate::error::{Error, Result};
use crate::types::ConnectionSession;

/// Keepalive interval written into the peer section, in seconds
pub const PERSISTENT_KEEPALIVE: u16 = 15;

/// Route every IPv4 and IPv6 destination through the tunnel
pub const ALLOWED_IPS: &str = "0.0.0.0/0, ::/0";

/// Render the tunnel configuration block for a session
///
/// Pure function: the same session, key and settings always produce the
/// same bytes. Fails when the session offers no WireGuard UDP port or when
/// the private key is empty.
pub fn render_config(
    session: &ConnectionSession,
    private_key: &str,
    settings: &TunnelSettings,
) -> Result<String> {
    if private_key.trim().is_empty() {
        return Err(Error::Credentials("WireGuard private key is empty".to_string()));
    }

    let port = session
        .ports
        .wireguard
        .udp
        .first()
        .ok_or_else(|| Error::Session("no WireGuard UDP port offered".to_string()))?;

    let lines = [
        "[Interface]".to_string(),
        format!("PrivateKey = {}", private_key),
        format!("Address = {}/32", session.internal_ip),
        format!("DNS = {}", settings.dns.join(", ")),
        format!("ExcludedApplications = {}", settings.application_id),
        String::new(),
        "[Peer]".to_string(),
        format!("PublicKey = {}", session.public_key),
        format!("Endpoint = {}:{}", session.server_ip, port),
        format!("PersistentKeepalive = {}", PERSISTENT_KEEPALIVE),
        format!("AllowedIPs = {}", ALLOWED_IPS),
    ];

    Ok(lines.join("\n"))
}

/// Copy of a rendered block with the private key masked, for logging
pub fn redact_private_key(config: &str) -> String {
    config
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("PrivateKey") {
                "PrivateKey = (hidden)"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read the `Endpoint` value from the peer section of a rendered block
pub fn endpoint(config: &str) -> Option<&str> {
    config
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "Endpoint")
        .map(|(_, value)| value.trim())
}
