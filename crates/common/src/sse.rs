// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 DicyVPN Contributors

//! Server-Sent Events listener for real-time tunnel status updates
//!
//! Framework-agnostic SSE client that works with any async runtime (tokio).

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::daemon_client::{add_auth_header, create_daemon_client, DaemonClientConfig};
use crate::types::StatusEvent;

/// Event listener for the daemon SSE stream
pub struct EventListener {
    config: DaemonClientConfig,
}

impl EventListener {
    pub fn new(config: DaemonClientConfig) -> Self {
        Self { config }
    }

    /// Start listening to daemon events
    /// Returns a channel receiver that yields StatusEvent items.
    /// Automatically reconnects with exponential backoff if the stream drops.
    pub async fn listen(&self) -> Result<mpsc::Receiver<StatusEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                match Self::stream_events(&config, tx.clone()).await {
                    Ok(()) => backoff = Duration::from_secs(1),
                    Err(e) => tracing::warn!("Event stream error: {}", e),
                }

                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        Ok(rx)
    }

    async fn stream_events(
        config: &DaemonClientConfig,
        tx: mpsc::Sender<StatusEvent>,
    ) -> Result<()> {
        let url = format!("{}/api/events", config.daemon_base_url()?);
        let client = create_daemon_client(config)?;

        let response = add_auth_header(client.get(&url), config)?
            .send()
            .await
            .context("Failed to connect to event stream")?;

        if !response.status().is_success() {
            anyhow::bail!("Event stream request failed: {}", response.status());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Error reading event stream: {}", e);
                    break;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find("\n\n") {
                let message: String = buffer.drain(..pos + 2).collect();

                if let Some(event) = parse_sse_message(&message) {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Receiver dropped, stopping event listener");
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for EventListener {
    fn default() -> Self {
        Self::new(DaemonClientConfig::default())
    }
}

/// Parse one SSE message block into a StatusEvent
///
/// Comment lines and non-data fields are ignored. Returns `None` when the block
/// carries no parseable `data:` payload.
pub fn parse_sse_message(message: &str) -> Option<StatusEvent> {
    message.lines().find_map(parse_data_line)
}

/// Parse a single `data:` line
pub fn parse_data_line(line: &str) -> Option<StatusEvent> {
    let data = line.trim_end().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<StatusEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Failed to parse SSE event: {} (error: {})", data, e);
            None
        }
    }
}
