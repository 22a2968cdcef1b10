//! Outbound-identity control for the scrape stage.
//!
//! Each scrape slot holds its own outbound identity and renews it through
//! [`ProxyControl`] after a sampled number of fetches. The control plane is
//! an HTTP sidecar; one endpoint, one POST per renewal.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use flywheel_scheduler::SlotId;
use flywheel_shared::{FlywheelError, Result};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("flywheel/", env!("CARGO_PKG_VERSION"));

/// Rotates the outbound identity bound to one scrape slot.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Request a fresh identity for `slot`. Returns once the new identity is
    /// active; failures leave the old identity in place.
    async fn renew_identity(&self, slot: SlotId) -> Result<()>;
}

#[derive(Serialize)]
struct RenewRequest {
    slot: SlotId,
}

/// HTTP client for the identity-rotation sidecar.
pub struct HttpProxyControl {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProxyControl {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FlywheelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ProxyControl for HttpProxyControl {
    async fn renew_identity(&self, slot: SlotId) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RenewRequest { slot })
            .send()
            .await
            .map_err(|e| FlywheelError::Network(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlywheelError::Network(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }

        info!(%slot, "outbound identity renewed");
        Ok(())
    }
}

/// No-op control for runs without an identity sidecar.
pub struct NullProxyControl;

#[async_trait]
impl ProxyControl for NullProxyControl {
    async fn renew_identity(&self, _slot: SlotId) -> Result<()> {
        Ok(())
    }
}
