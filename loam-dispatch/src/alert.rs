use std::sync::Mutex;

use async_trait::async_trait;
use loam_core::{Alert, AlertKind, AlertSeverity};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AlertConfig {
    #[default]
    Log,
    Webhook {
        url: String,
    },
}

/// Receives every alert the orchestrator and transport raise.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn raise(&self, alert: Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the log at a level matching their severity.
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn raise(&self, alert: Alert) -> Result<(), AlertError> {
        let node_id = alert.node_id.map(|n| n.0);
        match alert.severity {
            AlertSeverity::Info => {
                info!(alert_id = %alert.id.0, kind = ?alert.kind, node_id, "{}", alert.message)
            }
            AlertSeverity::Warning => {
                warn!(alert_id = %alert.id.0, kind = ?alert.kind, node_id, "{}", alert.message)
            }
            AlertSeverity::Critical | AlertSeverity::Fatal => error!(
                alert_id = %alert.id.0,
                kind = ?alert.kind,
                severity = ?alert.severity,
                node_id,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Posts each alert as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn raise(&self, alert: Alert) -> Result<(), AlertError> {
        let resp = self.http.post(&self.url).json(&alert).send().await?;
        if !resp.status().is_success() {
            return Err(AlertError::Status(resp.status()));
        }
        Ok(())
    }
}

/// Keeps alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        self.alerts().iter().map(|a| a.kind).collect()
    }

    pub fn find(&self, kind: AlertKind) -> Option<Alert> {
        self.alerts().into_iter().find(|a| a.kind == kind)
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn raise(&self, alert: Alert) -> Result<(), AlertError> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
        Ok(())
    }
}
