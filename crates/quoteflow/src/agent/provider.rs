//! Remote browser-automation provider API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{create_http_client, join_url, sanitize_error_body};
use crate::model::{CaptchaChallenge, RecipeStep};
use crate::retry::{classify_message, ErrorKind, QuoteError};

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Transport(String),

    #[error("Provider request timed out: {0}")]
    Timeout(String),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Maps a provider-side failure into the local taxonomy.
    pub fn to_quote_error(&self) -> QuoteError {
        let kind = match self {
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::Transport(_) => ErrorKind::PortalUnavailable,
            ProviderError::Status { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::PortalUnavailable
            }
            ProviderError::Status { status: 408, .. } => ErrorKind::Timeout,
            ProviderError::Status { .. } | ProviderError::Decode(_) => ErrorKind::Unknown,
        };
        QuoteError::new(kind, self.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

/// A single automation task, one per carrier execution.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Natural-language navigation instructions.
    pub task: String,
    pub start_url: Option<String>,
    pub browser_session_id: String,
    /// Values the provider substitutes into forms without showing them to
    /// the model, e.g. the portal password.
    pub secrets: BTreeMap<String, SecretString>,
    pub captcha_solution: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// One step the provider reports having taken.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStep {
    #[serde(default, alias = "action_type")]
    pub action: Option<String>,
    #[serde(default, alias = "selector")]
    pub target: Option<String>,
    #[serde(default, alias = "value_from")]
    pub value_from: Option<String>,
    #[serde(default, alias = "next_goal")]
    pub description: Option<String>,
}

impl ProviderStep {
    pub fn to_recipe_step(&self) -> Option<RecipeStep> {
        let action = self.action.clone().filter(|a| !a.is_empty())?;
        Some(RecipeStep {
            action,
            target: self.target.clone(),
            value_from: self.value_from.clone(),
            description: self.description.clone(),
        })
    }
}

/// Provider task lifecycle, normalized from its status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    CaptchaRequired,
    Finished,
    Failed,
    Stopped,
}

impl TaskState {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" | "queued" | "pending" => TaskState::Pending,
            "captcha_required" | "captcha" | "paused" => TaskState::CaptchaRequired,
            "finished" | "completed" | "succeeded" => TaskState::Finished,
            "failed" | "error" => TaskState::Failed,
            "stopped" | "cancelled" | "canceled" => TaskState::Stopped,
            _ => TaskState::Running,
        }
    }
}

/// Snapshot returned by the provider's status endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "current_step")]
    pub current_step: Option<String>,
    #[serde(default, alias = "step_number")]
    pub step_number: Option<u32>,
    #[serde(default, alias = "total_steps")]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default, alias = "structured_output")]
    pub structured_output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "error_code")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub captcha: Option<CaptchaChallenge>,
    #[serde(default, alias = "screenshot_url")]
    pub screenshot_url: Option<String>,
    #[serde(default)]
    pub steps: Vec<ProviderStep>,
    #[serde(default, alias = "field_mappings")]
    pub field_mappings: BTreeMap<String, String>,
}

impl TaskStatus {
    pub fn state(&self) -> TaskState {
        TaskState::parse(&self.status)
    }

    /// Maps a failed task onto the local taxonomy. Known provider codes
    /// win; otherwise the message is classified by keyword.
    pub fn failure(&self) -> QuoteError {
        let message = self
            .error
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "automation task failed".to_string());

        let kind = self
            .error_code
            .as_deref()
            .and_then(map_error_code)
            .unwrap_or_else(|| classify_message(&message));
        QuoteError::new(kind, message)
    }
}

fn map_error_code(code: &str) -> Option<ErrorKind> {
    if let Some(kind) = ErrorKind::parse(&code.to_ascii_uppercase()) {
        return Some(kind);
    }
    match code.to_ascii_lowercase().as_str() {
        "login_failed" | "auth_failed" | "invalid_credentials" => Some(ErrorKind::CredentialsInvalid),
        "captcha_unsolved" | "captcha_detected" => Some(ErrorKind::CaptchaFailed),
        "site_unreachable" | "navigation_error" | "http_error" => Some(ErrorKind::PortalUnavailable),
        "element_not_found" | "selector_not_found" | "layout_changed" => Some(ErrorKind::FormChanged),
        "max_steps_reached" | "task_timeout" => Some(ErrorKind::Timeout),
        _ => None,
    }
}

/// Create/poll/cancel operations of a remote automation provider.
#[async_trait]
pub trait AutomationProvider: Send + Sync {
    /// Starts a task and returns its identifier.
    async fn create_task(&self, request: &TaskRequest) -> Result<String, ProviderError>;

    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, ProviderError>;

    async fn cancel_task(&self, task_id: &str) -> Result<(), ProviderError>;

    /// Resumes a task paused on a CAPTCHA.
    async fn submit_captcha_solution(
        &self,
        task_id: &str,
        solution: &str,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    id: String,
}

/// Bearer-authenticated JSON client for the provider's v1 API.
pub struct HttpAutomationProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpAutomationProvider {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, ProviderError> {
        let client = create_http_client()
            .map_err(|e| ProviderError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Status {
            status: status.as_u16(),
            body: sanitize_error_body(&body),
        })
    }
}

fn request_body(request: &TaskRequest) -> serde_json::Value {
    let secrets: BTreeMap<&str, &str> = request
        .secrets
        .iter()
        .map(|(k, v)| (k.as_str(), v.expose_secret()))
        .collect();

    serde_json::json!({
        "task": request.task,
        "startUrl": request.start_url,
        "browserSessionId": request.browser_session_id,
        "secrets": secrets,
        "captchaSolution": request.captcha_solution,
        "metadata": request.metadata,
    })
}

#[async_trait]
impl AutomationProvider for HttpAutomationProvider {
    async fn create_task(&self, request: &TaskRequest) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(join_url(&self.base_url, "api/v1/run-task"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request_body(request))
            .send()
            .await?;
        let created: CreateTaskResponse = Self::check(response).await?.json().await?;
        Ok(created.id)
    }

    async fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let response = self
            .client
            .get(join_url(&self.base_url, &format!("api/v1/task/{}", task_id)))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(join_url(&self.base_url, "api/v1/stop-task"))
            .query(&[("task_id", task_id)])
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn submit_captcha_solution(
        &self,
        task_id: &str,
        solution: &str,
    ) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(join_url(&self.base_url, "api/v1/resume-task"))
            .query(&[("task_id", task_id)])
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({ "captchaSolution": solution }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_parse() {
        assert_eq!(TaskState::parse("created"), TaskState::Pending);
        assert_eq!(TaskState::parse("RUNNING"), TaskState::Running);
        assert_eq!(TaskState::parse("paused"), TaskState::CaptchaRequired);
        assert_eq!(TaskState::parse("finished"), TaskState::Finished);
        assert_eq!(TaskState::parse("failed"), TaskState::Failed);
        assert_eq!(TaskState::parse("stopped"), TaskState::Stopped);
        assert_eq!(TaskState::parse("thinking"), TaskState::Running);
    }

    #[test]
    fn test_failure_prefers_error_code() {
        let status = TaskStatus {
            status: "failed".to_string(),
            error: Some("something about a timeout".to_string()),
            error_code: Some("login_failed".to_string()),
            ..Default::default()
        };
        assert_eq!(status.failure().kind, ErrorKind::CredentialsInvalid);

        let status = TaskStatus {
            error_code: Some("FORM_CHANGED".to_string()),
            ..Default::default()
        };
        assert_eq!(status.failure().kind, ErrorKind::FormChanged);
    }

    #[test]
    fn test_failure_falls_back_to_message() {
        let status = TaskStatus {
            status: "failed".to_string(),
            error: Some("Navigation timed out after 30000ms".to_string()),
            error_code: Some("E_INTERNAL_42".to_string()),
            ..Default::default()
        };
        assert_eq!(status.failure().kind, ErrorKind::Timeout);

        let status = TaskStatus::default();
        let failure = status.failure();
        assert_eq!(failure.kind, ErrorKind::Unknown);
        assert_eq!(failure.message, "automation task failed");
    }

    #[test]
    fn test_provider_error_mapping() {
        let unavailable = ProviderError::Status {
            status: 503,
            body: String::new(),
        };
        assert_eq!(unavailable.to_quote_error().kind, ErrorKind::PortalUnavailable);
        assert_eq!(
            ProviderError::Status { status: 429, body: String::new() }
                .to_quote_error()
                .kind,
            ErrorKind::PortalUnavailable
        );
        assert_eq!(
            ProviderError::Status { status: 400, body: String::new() }
                .to_quote_error()
                .kind,
            ErrorKind::Unknown
        );
        assert_eq!(
            ProviderError::Timeout("slow".to_string()).to_quote_error().kind,
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_status_accepts_snake_case() {
        let status: TaskStatus = serde_json::from_str(
            r##"{
                "id": "task-1",
                "status": "running",
                "current_step": "Logging in",
                "step_number": 2,
                "total_steps": 10,
                "steps": [{"action_type": "click", "selector": "#login"}]
            }"##,
        )
        .unwrap();
        assert_eq!(status.current_step.as_deref(), Some("Logging in"));
        assert_eq!(status.step_number, Some(2));
        assert_eq!(status.steps[0].action.as_deref(), Some("click"));
        assert_eq!(status.steps[0].target.as_deref(), Some("#login"));
    }

    #[test]
    fn test_request_body_carries_secrets_separately() {
        let mut secrets = BTreeMap::new();
        secrets.insert("password".to_string(), SecretString::from("hunter2"));
        let request = TaskRequest {
            task: "Log in with username 'agent'".to_string(),
            start_url: Some("https://portal.acme.test".to_string()),
            browser_session_id: "session-1".to_string(),
            secrets,
            captcha_solution: None,
            metadata: BTreeMap::new(),
        };
        let body = request_body(&request);
        assert_eq!(body["secrets"]["password"], "hunter2");
        assert!(!body["task"].as_str().unwrap().contains("hunter2"));
        assert_eq!(body["browserSessionId"], "session-1");
    }

    #[test]
    fn test_provider_step_to_recipe_step() {
        let step = ProviderStep {
            action: Some("fill".to_string()),
            target: Some("#zip".to_string()),
            ..Default::default()
        };
        assert_eq!(step.to_recipe_step().unwrap().action, "fill");
        assert!(ProviderStep::default().to_recipe_step().is_none());
    }
}
