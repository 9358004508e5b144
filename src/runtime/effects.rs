/// Downstream side effects of approval transitions
///
/// Notifications and case records are delivered to external services over
/// HTTP. Both may fail; callers log the failure and carry on, since neither
/// can undo a committed transition.

use crate::config::ServicesConfig;
use crate::workflow::types::{now, Workflow};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::{future::Future, sync::Arc, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected with status {status}")]
    Rejected { status: u16 },
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Transport(e.to_string())
    }
}

/// Run a downstream call with an upper bound on how long it may take
pub async fn with_timeout<F>(limit: Duration, call: F) -> Result<(), DeliveryError>
where
    F: Future<Output = Result<(), DeliveryError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| DeliveryError::Timeout(limit))?
}

/// Why a notification is being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    /// A workflow is waiting for the recipient to approve it
    ApprovalRequested,
    /// A workflow was sent back to its submitter
    ReturnedForEdits,
    /// A next step fired
    NextStep,
}

/// An email-style notification tied to a workflow
#[derive(Debug, Clone, Copy)]
pub struct Notification<'a> {
    pub kind: NotificationKind,
    pub workflow: &'a Workflow,
    pub to: &'a str,
    pub base_url: &'a str,
    pub note: Option<&'a str>,
}

impl Notification<'_> {
    /// Link to the workflow in the UI
    pub fn workflow_url(&self) -> String {
        workflow_url(self.base_url, &self.workflow.id)
    }
}

fn workflow_url(base_url: &str, workflow_id: &str) -> String {
    format!("{}/workflows/{}", base_url.trim_end_matches('/'), workflow_id)
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, notification: Notification<'_>) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait CaseRecordService: Send + Sync {
    /// Write a durable record of a fully approved workflow onto the subject's case
    async fn record(&self, workflow: &Workflow) -> Result<(), DeliveryError>;
}

/// Posts notifications as JSON to a notification gateway
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl NotificationService for HttpNotifier {
    async fn send(&self, notification: Notification<'_>) -> Result<(), DeliveryError> {
        let body = json!({
            "kind": notification.kind,
            "workflowId": notification.workflow.id,
            "formId": notification.workflow.form_id,
            "socialCareId": notification.workflow.social_care_id,
            "to": notification.to,
            "url": notification.workflow_url(),
            "note": notification.note,
        });

        tracing::debug!("📧 Posting {:?} notification to {}", notification.kind, self.endpoint);
        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

/// Posts case records as JSON to the case-management API
#[derive(Debug, Clone)]
pub struct HttpCaseRecorder {
    client: reqwest::Client,
    endpoint: String,
    base_url: String,
}

impl HttpCaseRecorder {
    pub fn new(endpoint: String, base_url: String, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            base_url,
        })
    }
}

#[async_trait]
impl CaseRecordService for HttpCaseRecorder {
    async fn record(&self, workflow: &Workflow) -> Result<(), DeliveryError> {
        let body = json!({
            "workflowId": workflow.id,
            "formId": workflow.form_id,
            "socialCareId": workflow.social_care_id,
            "approvedBy": workflow.manager_approved_by,
            "authorisedBy": workflow.panel_approved_by,
            "recordedAt": now().to_rfc3339(),
            "url": workflow_url(&self.base_url, &workflow.id),
        });

        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

/// Stand-in used when no notification endpoint is configured
#[derive(Debug, Clone, Default)]
pub struct LogOnlyNotifier;

#[async_trait]
impl NotificationService for LogOnlyNotifier {
    async fn send(&self, notification: Notification<'_>) -> Result<(), DeliveryError> {
        tracing::info!(
            "📧 [log only] {:?} notification for workflow {} to {} ({})",
            notification.kind,
            notification.workflow.id,
            notification.to,
            notification.workflow_url()
        );
        Ok(())
    }
}

/// Stand-in used when no case-record endpoint is configured
#[derive(Debug, Clone, Default)]
pub struct LogOnlyCaseRecorder;

#[async_trait]
impl CaseRecordService for LogOnlyCaseRecorder {
    async fn record(&self, workflow: &Workflow) -> Result<(), DeliveryError> {
        tracing::info!(
            "🗂️ [log only] case record for workflow {} (subject {})",
            workflow.id,
            workflow.social_care_id
        );
        Ok(())
    }
}

/// Build the notification service described by `config`
pub fn notifier_from_config(config: &ServicesConfig) -> anyhow::Result<Arc<dyn NotificationService>> {
    Ok(match &config.notify_url {
        Some(endpoint) => Arc::new(HttpNotifier::new(endpoint.clone(), config.timeout())?),
        None => {
            tracing::warn!("⚠️ CASEGATE_NOTIFY_URL not set, notifications will only be logged");
            Arc::new(LogOnlyNotifier)
        }
    })
}

/// Build the case-record service described by `config`
pub fn case_recorder_from_config(config: &ServicesConfig) -> anyhow::Result<Arc<dyn CaseRecordService>> {
    Ok(match &config.case_record_url {
        Some(endpoint) => Arc::new(HttpCaseRecorder::new(
            endpoint.clone(),
            config.base_url.clone(),
            config.timeout(),
        )?),
        None => {
            tracing::warn!("⚠️ CASEGATE_CASE_RECORD_URL not set, case records will only be logged");
            Arc::new(LogOnlyCaseRecorder)
        }
    })
}
