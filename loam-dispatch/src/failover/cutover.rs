use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use loam_core::NodeId;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CutoverError {
    #[error("cutover request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cutover endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("cutover failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CutoverConfig {
    #[default]
    Log,
    Webhook {
        /// Base URL; `/reroute` and `/power-on` are appended.
        url: String,
    },
}

/// Routing and power control for processing nodes.
#[async_trait]
pub trait Cutover: Send + Sync + 'static {
    /// Point traffic for the processing tier at `to` instead of `from`.
    async fn reroute(&self, from: NodeId, to: NodeId) -> Result<(), CutoverError>;

    async fn power_on(&self, node: NodeId) -> Result<(), CutoverError>;
}

/// Only logs. For deployments where routing follows the primary by itself.
#[derive(Debug, Clone, Default)]
pub struct LogCutover;

#[async_trait]
impl Cutover for LogCutover {
    async fn reroute(&self, from: NodeId, to: NodeId) -> Result<(), CutoverError> {
        info!(from = from.0, to = to.0, "rerouting processing traffic");
        Ok(())
    }

    async fn power_on(&self, node: NodeId) -> Result<(), CutoverError> {
        info!(node_id = node.0, "power-on requested");
        Ok(())
    }
}

/// Drives an external routing/power controller over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookCutover {
    http: reqwest::Client,
    url: String,
}

impl WebhookCutover {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_owned(),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), CutoverError> {
        let resp = self
            .http
            .post(format!("{}/{path}", self.url))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CutoverError::Status(resp.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cutover for WebhookCutover {
    async fn reroute(&self, from: NodeId, to: NodeId) -> Result<(), CutoverError> {
        self.post("reroute", serde_json::json!({ "from": from.0, "to": to.0 }))
            .await
    }

    async fn power_on(&self, node: NodeId) -> Result<(), CutoverError> {
        self.post("power-on", serde_json::json!({ "node_id": node.0 }))
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoverCall {
    Reroute { from: NodeId, to: NodeId },
    PowerOn(NodeId),
}

/// Records calls and can be made slow or failing.
#[derive(Debug, Default)]
pub struct MockCutover {
    delay: Duration,
    fail: bool,
    calls: Mutex<Vec<CutoverCall>>,
}

impl MockCutover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> Vec<CutoverCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn call(&self, call: CutoverCall) -> Result<(), CutoverError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(CutoverError::Failed("simulated cutover failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cutover for MockCutover {
    async fn reroute(&self, from: NodeId, to: NodeId) -> Result<(), CutoverError> {
        self.call(CutoverCall::Reroute { from, to }).await
    }

    async fn power_on(&self, node: NodeId) -> Result<(), CutoverError> {
        self.call(CutoverCall::PowerOn(node)).await
    }
}
