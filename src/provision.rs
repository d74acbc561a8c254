//! Provisioning boundary — the out-of-process task-creation and notification
//! integrations invoked during run initiation.
//!
//! The core only depends on the [`Provisioner`] port; the HTTP adapter talks
//! to whatever issue tracker / notification webhook is configured, and the
//! no-op adapter backs tests and unconfigured deployments.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::run::catalog;

/// Caller-supplied description of the workflow to provision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Short summary of what the participant should accomplish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Free-form detail passed through to the tracker integration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Output of the analyze stage: what task to create.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSpec {
    pub title: String,
    pub body: String,
}

/// Output of the generate stage: what the participant receives.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_url: Option<String>,
    pub message: String,
}

/// Port for the external provisioning integrations. Stages line up with the
/// `analyzing → generating → sending` phases published during initiation.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Work out what task the workflow request calls for.
    async fn analyze(
        &self,
        participant_key: &str,
        platform: &str,
        request: &WorkflowRequest,
    ) -> Result<TaskSpec, ProvisionError>;

    /// Create the task and produce the content the participant will receive.
    async fn generate(&self, spec: &TaskSpec) -> Result<WorkflowContent, ProvisionError>;

    /// Dispatch the notification to the participant.
    async fn send(
        &self,
        participant_key: &str,
        content: &WorkflowContent,
    ) -> Result<(), ProvisionError>;
}

/// Configuration for the HTTP provisioning adapter.
#[derive(Clone)]
pub struct ProvisionConfig {
    pub tracker_url: String,
    pub notify_url: String,
    pub api_token: SecretString,
}

impl ProvisionConfig {
    /// Read adapter configuration from the environment. Returns `None` when
    /// no tracker URL is set, in which case the no-op adapter is used.
    pub fn from_env() -> Option<Self> {
        let tracker_url = std::env::var("ONBOARD_SYNC_TRACKER_URL").ok()?;
        let notify_url = std::env::var("ONBOARD_SYNC_NOTIFY_URL")
            .unwrap_or_else(|_| tracker_url.clone());
        let api_token =
            SecretString::from(std::env::var("ONBOARD_SYNC_API_TOKEN").unwrap_or_default());
        Some(Self {
            tracker_url,
            notify_url,
            api_token,
        })
    }
}

/// HTTP adapter: posts task creation to the tracker and dispatch requests to
/// the notification webhook.
pub struct HttpProvisioner {
    config: ProvisionConfig,
    client: reqwest::Client,
}

impl HttpProvisioner {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn analyze(
        &self,
        participant_key: &str,
        platform: &str,
        request: &WorkflowRequest,
    ) -> Result<TaskSpec, ProvisionError> {
        let catalog_name =
            catalog::catalog_name(platform).ok_or_else(|| ProvisionError::StageFailed {
                stage: "analyze".into(),
                reason: format!("no catalog for platform {platform}"),
            })?;
        let title = request
            .summary
            .clone()
            .unwrap_or_else(|| format!("{catalog_name} for {participant_key}"));
        let body = request
            .details
            .as_ref()
            .and_then(|d| d.as_str().map(String::from))
            .unwrap_or_else(|| format!("Complete the {catalog_name} workflow."));
        debug!(participant = participant_key, platform, "Workflow request analyzed");
        Ok(TaskSpec { title, body })
    }

    async fn generate(&self, spec: &TaskSpec) -> Result<WorkflowContent, ProvisionError> {
        let response = self
            .client
            .post(&self.config.tracker_url)
            .bearer_auth(self.config.api_token.expose_secret())
            .json(&spec)
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let task_url = body
            .get("url")
            .and_then(|v| v.as_str())
            .map(String::from);
        info!(title = %spec.title, task_url = ?task_url, "Task created");
        Ok(WorkflowContent {
            task_url,
            message: spec.body.clone(),
        })
    }

    async fn send(
        &self,
        participant_key: &str,
        content: &WorkflowContent,
    ) -> Result<(), ProvisionError> {
        self.client
            .post(&self.config.notify_url)
            .bearer_auth(self.config.api_token.expose_secret())
            .json(&serde_json::json!({
                "to": participant_key,
                "message": content.message,
                "task_url": content.task_url,
            }))
            .send()
            .await?
            .error_for_status()?;
        info!(participant = participant_key, "Notification dispatched");
        Ok(())
    }
}

/// No-op adapter: succeeds immediately with canned content.
#[derive(Default)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn analyze(
        &self,
        participant_key: &str,
        platform: &str,
        request: &WorkflowRequest,
    ) -> Result<TaskSpec, ProvisionError> {
        let name = catalog::catalog_name(platform).unwrap_or(platform);
        Ok(TaskSpec {
            title: request
                .summary
                .clone()
                .unwrap_or_else(|| format!("{name} for {participant_key}")),
            body: format!("Complete the {name} workflow."),
        })
    }

    async fn generate(&self, spec: &TaskSpec) -> Result<WorkflowContent, ProvisionError> {
        Ok(WorkflowContent {
            task_url: None,
            message: spec.body.clone(),
        })
    }

    async fn send(&self, _participant_key: &str, _content: &WorkflowContent) -> Result<(), ProvisionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_provisioner_round_trip() {
        let provisioner = NoopProvisioner;
        let spec = provisioner
            .analyze("user@co.com", "jira", &WorkflowRequest::default())
            .await
            .unwrap();
        assert!(spec.title.contains("Jira"));
        let content = provisioner.generate(&spec).await.unwrap();
        provisioner.send("user@co.com", &content).await.unwrap();
    }

    #[tokio::test]
    async fn analyze_prefers_caller_summary() {
        let provisioner = NoopProvisioner;
        let request = WorkflowRequest {
            summary: Some("Set up tracker access".into()),
            details: None,
        };
        let spec = provisioner
            .analyze("user@co.com", "jira", &request)
            .await
            .unwrap();
        assert_eq!(spec.title, "Set up tracker access");
    }
}
