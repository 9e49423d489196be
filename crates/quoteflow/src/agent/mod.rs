//! Automation agent abstraction.
//!
//! A [`QuoteAgent`] drives one carrier portal for one execution. Backends
//! are picked per carrier by an [`AgentFactory`]; the orchestrator only
//! ever sees the trait.

pub mod extract;
pub mod factory;
pub mod provider;
pub mod remote;
pub mod task;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{
    CaptchaChallenge, CarrierCredentials, ClientData, QuoteResult, QuoteType, Recipe,
};
use crate::retry::QuoteError;
use crate::session::BrowserSession;

pub use factory::{AgentFactory, RemoteAgentFactory};
pub use provider::{AutomationProvider, HttpAutomationProvider, ProviderError, TaskRequest, TaskStatus};
pub use remote::{RemoteAgentSettings, RemoteProviderAgent};

/// Receives in-order progress notifications from a running agent.
///
/// Calls are synchronous and made on the agent's own task.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, step: &str, percent: u8);

    /// Latest page snapshot, when the backend produces one.
    fn screenshot(&self, _url: &str) {}
}

/// Progress reporter that drops everything.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _step: &str, _percent: u8) {}
}

/// Hands a CAPTCHA to a human and waits for the answer.
///
/// There is no internal timeout; callers impose their own deadline.
#[async_trait]
pub trait CaptchaHandler: Send + Sync {
    async fn request_solution(&self, challenge: CaptchaChallenge) -> Result<String, QuoteError>;
}

/// Everything an agent needs for one carrier execution.
#[derive(Clone)]
pub struct QuoteParams {
    pub job_id: String,
    pub carrier_job_id: String,
    pub carrier_code: String,
    pub quote_type: QuoteType,
    pub portal_url: Option<String>,
    pub client_data: ClientData,
    pub credentials: CarrierCredentials,
    pub recipe: Option<Recipe>,
    pub session: BrowserSession,
    /// Solution to a CAPTCHA raised by a previous run of the same attempt.
    pub captcha_solution: Option<String>,
    pub progress: Arc<dyn ProgressReporter>,
    pub captcha: Arc<dyn CaptchaHandler>,
    pub cancel: CancellationToken,
}

impl QuoteParams {
    pub fn uses_recipe(&self) -> bool {
        self.recipe.is_some()
    }
}

#[async_trait]
pub trait QuoteAgent: Send + Sync {
    /// Backend label for logs, e.g. `remote/recipe`.
    fn name(&self) -> &str;

    /// Runs the quote flow. Failures come back inside the result, never as
    /// a panic; a partially populated `data` still counts as success.
    async fn execute_quote(&self, params: &QuoteParams) -> QuoteResult;

    /// Aborts the in-flight remote work, best-effort.
    async fn cancel(&self);
}
