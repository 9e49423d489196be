//! Agent backed by a remote automation provider.
//!
//! One provider task per execution: create it, poll until it settles,
//! relay progress and CAPTCHA pauses, then extract the quote.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::extract::extract_quote;
use super::provider::{AutomationProvider, TaskState, TaskStatus};
use super::task::build_task_request;
use super::{QuoteAgent, QuoteParams};
use crate::model::{DiscoveredRecipe, QuoteResult, QuoteResultData};
use crate::retry::QuoteError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Consecutive status-poll failures tolerated before the run fails.
const MAX_POLL_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RemoteAgentSettings {
    pub poll_interval: Duration,
    /// Wall-clock limit for one task, not counting time spent waiting on a
    /// human CAPTCHA solution.
    pub task_timeout: Duration,
}

impl Default for RemoteAgentSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

pub struct RemoteProviderAgent {
    provider: Arc<dyn AutomationProvider>,
    settings: RemoteAgentSettings,
    name: &'static str,
    task_id: Mutex<Option<String>>,
}

impl RemoteProviderAgent {
    /// `recipe_mode` only affects the backend label; whether steps are
    /// recorded follows the params handed to each execution.
    pub fn new(
        provider: Arc<dyn AutomationProvider>,
        settings: RemoteAgentSettings,
        recipe_mode: bool,
    ) -> Self {
        Self {
            provider,
            settings,
            name: if recipe_mode {
                "remote/recipe"
            } else {
                "remote/discovery"
            },
            task_id: Mutex::new(None),
        }
    }

    fn set_task_id(&self, id: Option<String>) {
        if let Ok(mut guard) = self.task_id.lock() {
            *guard = id;
        }
    }

    fn current_task_id(&self) -> Option<String> {
        self.task_id.lock().ok().and_then(|g| g.clone())
    }

    async fn stop_task(&self, task_id: &str) {
        if let Err(e) = self.provider.cancel_task(task_id).await {
            warn!(task_id = %task_id, "Failed to stop automation task: {}", e);
        }
    }

    async fn run(
        &self,
        params: &QuoteParams,
        screenshots: &mut Vec<String>,
    ) -> Result<(QuoteResultData, Option<DiscoveredRecipe>), QuoteError> {
        if params.cancel.is_cancelled() {
            return Err(cancelled_error());
        }

        params.progress.report("starting automation task", 5);
        let request = build_task_request(params);
        let task_id = self
            .provider
            .create_task(&request)
            .await
            .map_err(|e| e.to_quote_error())?;
        self.set_task_id(Some(task_id.clone()));
        info!(
            agent = self.name,
            carrier = %params.carrier_code,
            task_id = %task_id,
            "Automation task created"
        );
        params.progress.report("task started", 10);

        let mut deadline = Instant::now() + self.settings.task_timeout;
        let mut last_percent = 10u8;
        let mut last_step: Option<String> = None;
        let mut poll_errors = 0u32;
        let mut captcha_submitted = false;

        loop {
            let status = match self.provider.get_task_status(&task_id).await {
                Ok(status) => {
                    poll_errors = 0;
                    status
                }
                Err(e) => {
                    poll_errors += 1;
                    if poll_errors >= MAX_POLL_ERRORS {
                        self.stop_task(&task_id).await;
                        return Err(e.to_quote_error());
                    }
                    warn!(task_id = %task_id, poll_errors, "Task status poll failed: {}", e);
                    TaskStatus::default()
                }
            };

            if let Some(url) = status.screenshot_url.as_deref() {
                if screenshots.last().map(String::as_str) != Some(url) {
                    params.progress.screenshot(url);
                    screenshots.push(url.to_string());
                }
            }

            let percent = progress_percent(&status).filter(|p| *p > last_percent);
            let new_step = status
                .current_step
                .as_deref()
                .filter(|step| last_step.as_deref() != Some(*step));
            if percent.is_some() || new_step.is_some() {
                last_percent = percent.unwrap_or(last_percent);
                let step = status.current_step.as_deref().unwrap_or("running");
                params.progress.report(step, last_percent);
                if let Some(step) = status.current_step.as_deref() {
                    last_step = Some(step.to_string());
                }
            }

            match status.state() {
                TaskState::Finished => {
                    let data = extract_quote(status.structured_output.as_ref(), status.output.as_deref());
                    let discovered = if params.uses_recipe() {
                        None
                    } else {
                        discovered_recipe(&status)
                    };
                    params.progress.report("extracting quote", last_percent.max(90));
                    return Ok((data, discovered));
                }
                TaskState::Failed => return Err(status.failure()),
                TaskState::Stopped => {
                    return Err(QuoteError::unknown("automation task was stopped"));
                }
                TaskState::CaptchaRequired if !captcha_submitted => {
                    let challenge = status.captcha.clone().unwrap_or_default();
                    debug!(task_id = %task_id, kind = %challenge.kind, "Task paused on CAPTCHA");
                    let waited_from = Instant::now();
                    let solution = tokio::select! {
                        _ = params.cancel.cancelled() => {
                            self.stop_task(&task_id).await;
                            return Err(cancelled_error());
                        }
                        solution = params.captcha.request_solution(challenge) => solution?,
                    };
                    deadline += waited_from.elapsed();
                    self.provider
                        .submit_captcha_solution(&task_id, &solution)
                        .await
                        .map_err(|e| e.to_quote_error())?;
                    captcha_submitted = true;
                }
                TaskState::CaptchaRequired => {}
                TaskState::Pending | TaskState::Running => captcha_submitted = false,
            }

            if Instant::now() >= deadline {
                self.stop_task(&task_id).await;
                return Err(QuoteError::timeout(format!(
                    "automation task exceeded {}s",
                    self.settings.task_timeout.as_secs()
                )));
            }

            tokio::select! {
                _ = params.cancel.cancelled() => {
                    self.stop_task(&task_id).await;
                    return Err(cancelled_error());
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}

fn cancelled_error() -> QuoteError {
    QuoteError::unknown("execution cancelled")
}

/// Maps provider progress onto 10..=90; the edges belong to setup and
/// extraction.
fn progress_percent(status: &TaskStatus) -> Option<u8> {
    let fraction = match (status.progress, status.step_number, status.total_steps) {
        (Some(p), _, _) if p > 1.0 => p / 100.0,
        (Some(p), _, _) => p,
        (None, Some(n), Some(total)) if total > 0 => n as f64 / total as f64,
        _ => return None,
    };
    let fraction = fraction.clamp(0.0, 1.0);
    Some(10 + (fraction * 80.0).round() as u8)
}

fn discovered_recipe(status: &TaskStatus) -> Option<DiscoveredRecipe> {
    let recipe = DiscoveredRecipe {
        steps: status
            .steps
            .iter()
            .filter_map(|s| s.to_recipe_step())
            .collect(),
        field_mappings: status.field_mappings.clone(),
    };
    (!recipe.is_empty()).then_some(recipe)
}

#[async_trait]
impl QuoteAgent for RemoteProviderAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute_quote(&self, params: &QuoteParams) -> QuoteResult {
        let mut screenshots = Vec::new();
        let outcome = self.run(params, &mut screenshots).await;
        self.set_task_id(None);
        match outcome {
            Ok((data, discovered)) => QuoteResult::success(data)
                .with_screenshots(screenshots)
                .with_discovered(discovered),
            Err(error) => QuoteResult::failure(error).with_screenshots(screenshots),
        }
    }

    async fn cancel(&self) {
        if let Some(task_id) = self.current_task_id() {
            self.stop_task(&task_id).await;
        }
    }
}
