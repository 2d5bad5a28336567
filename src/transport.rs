//! Agent transport - fire-and-forget push of a dispatched command.
//!
//! Delivery is not guaranteed; agents without a push URL pick commands up
//! through the heartbeat/poll channel, and the expiry sweep frees the slot
//! if nothing ever answers. A failed hand-off therefore never rolls back a
//! claimed command slot.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::models::{CommandKind, Device};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device has no push channel")]
    NoPushChannel,
    #[error("push delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn deliver(&self, device: &Device, command: CommandKind) -> Result<(), TransportError>;
}

/// Pushes the command to the agent's registered webhook.
pub struct PushTransport {
    http: reqwest::Client,
}

impl PushTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for PushTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandTransport for PushTransport {
    async fn deliver(&self, device: &Device, command: CommandKind) -> Result<(), TransportError> {
        let url = device
            .agent_push_url
            .as_deref()
            .ok_or(TransportError::NoPushChannel)?;

        self.http
            .post(url)
            .json(&json!({
                "device_id": device.id,
                "command": command,
            }))
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!("Pushed '{}' to agent on {}", command, device.hostname);
        Ok(())
    }
}
