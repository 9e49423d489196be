//! One carrier execution unit: slot, credentials, session, agent attempts
//! under the retry policy, and the terminal write.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::Shared;
use crate::agent::{CaptchaHandler, ProgressReporter, QuoteAgent, QuoteParams};
use crate::broadcast::CarrierProgressTracker;
use crate::model::{
    CaptchaChallenge, CarrierCredentials, CarrierJob, CarrierJobStatus, CarrierOutcome,
    ClientData, DiscoveredRecipe, Job, QuoteResultData, Recipe,
};
use crate::orchestrator::captcha::CaptchaBroker;
use crate::retry::{AttemptRecord, ErrorKind, QuoteError, RetryOutcome};
use crate::session::BrowserSession;
use crate::store::{JobStore, StoreError};

type AttemptValue = Option<(QuoteResultData, Option<DiscoveredRecipe>)>;

/// An unreachable store is an infrastructure fault, so the attempt stays
/// eligible for retry.
fn store_failure(e: StoreError) -> QuoteError {
    QuoteError::portal_unavailable(format!("job store error: {}", e))
}

/// Persists progress and mirrors it onto the broadcast channel.
struct CarrierProgress {
    store: JobStore,
    carrier_job_id: String,
    tracker: CarrierProgressTracker,
}

impl ProgressReporter for CarrierProgress {
    fn report(&self, step: &str, percent: u8) {
        match self
            .store
            .update_progress(&self.carrier_job_id, step, percent.min(100))
        {
            Ok(true) => self.tracker.step(step, percent.min(100)),
            Ok(false) => {}
            Err(e) => warn!("Failed to record progress: {}", e),
        }
    }

    fn screenshot(&self, url: &str) {
        if let Err(e) = self.store.set_screenshot(&self.carrier_job_id, url) {
            warn!("Failed to record screenshot: {}", e);
        }
        self.tracker.screenshot(url);
    }
}

/// Routes an agent's CAPTCHA hand-off through the broker.
struct CarrierCaptcha {
    broker: CaptchaBroker,
    carrier_job_id: String,
    tracker: CarrierProgressTracker,
    cancel: CancellationToken,
}

#[async_trait]
impl CaptchaHandler for CarrierCaptcha {
    async fn request_solution(&self, challenge: CaptchaChallenge) -> Result<String, QuoteError> {
        self.tracker
            .captcha_needed(challenge.prompt.as_deref().unwrap_or("CAPTCHA requires a human"));
        let solution = self
            .broker
            .await_solution(&self.carrier_job_id, &challenge, &self.cancel)
            .await?;
        self.tracker.resumed();
        Ok(solution)
    }
}

pub(crate) struct CarrierRun {
    pub shared: Arc<Shared>,
    pub job: Arc<Job>,
    pub client: Arc<ClientData>,
    pub carrier: CarrierJob,
    pub cancel: CancellationToken,
}

impl CarrierRun {
    pub async fn execute(self) -> Result<CarrierJobStatus, StoreError> {
        let span = info_span!(
            "carrier",
            job_id = %self.job.id,
            carrier = %self.carrier.carrier_code
        );
        self.execute_inner().instrument(span).await
    }

    async fn execute_inner(self) -> Result<CarrierJobStatus, StoreError> {
        let tracker = self.shared.progress.tracker(
            &self.job.id,
            &self.carrier.id,
            &self.carrier.carrier_code,
        );

        // A started unit holds exactly one session, even when cancelled.
        let _slot = match self.shared.carrier_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.settle(
                    failed(QuoteError::unknown("engine is shutting down"), None, Vec::new()),
                    &tracker,
                );
            }
        };

        let sessions = &self.shared.sessions;
        let lease = match self
            .shared
            .retry
            .run_infra("acquire_session", || sessions.acquire())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                let error = QuoteError::portal_unavailable(format!("no browser session: {}", e));
                return self.settle(failed(error, None, Vec::new()), &tracker);
            }
        };

        if self.cancel.is_cancelled() {
            lease.release().await;
            return self.settle(CarrierOutcome::Cancelled { attempts: Vec::new() }, &tracker);
        }

        let credentials = match self.fetch_credentials().await {
            Ok(credentials) => credentials,
            Err(error) => {
                lease.release().await;
                return self.settle(failed(error, None, Vec::new()), &tracker);
            }
        };

        let recipe = self
            .shared
            .store
            .find_active_recipe(&self.carrier.carrier_code, self.job.quote_type)
            .unwrap_or_else(|e| {
                warn!("Recipe lookup failed, running discovery: {}", e);
                None
            });
        let agent = self
            .shared
            .agents
            .create_agent(&self.carrier.carrier_code, recipe.as_ref());
        debug!(agent = agent.name(), "Agent selected");

        let outcome = self
            .run_attempts(
                agent.as_ref(),
                recipe.as_ref(),
                &credentials,
                lease.session(),
                &tracker,
            )
            .await;
        lease.release().await;

        let recipe_id = recipe.as_ref().map(|r| r.id.clone());
        let (outcome, discovered, failure) = if self.cancel.is_cancelled() {
            let attempts = outcome.history().to_vec();
            (CarrierOutcome::Cancelled { attempts }, None, None)
        } else {
            match outcome {
                RetryOutcome::Succeeded { value: None, .. } => {
                    return self.current_status();
                }
                RetryOutcome::Succeeded {
                    value: Some((data, discovered)),
                    history,
                } => (
                    CarrierOutcome::Completed {
                        data,
                        recipe_id,
                        attempts: history,
                    },
                    discovered,
                    None,
                ),
                RetryOutcome::Failed { error, history } => {
                    let kind = error.kind;
                    (failed(error, recipe_id, history), None, Some(kind))
                }
                RetryOutcome::Cancelled { history } => {
                    (CarrierOutcome::Cancelled { attempts: history }, None, None)
                }
            }
        };

        let completed = matches!(outcome, CarrierOutcome::Completed { .. });
        let status = self.settle(outcome, &tracker)?;
        if status == CarrierJobStatus::Completed && completed {
            self.learn(recipe.as_ref(), discovered);
        } else if let Some(kind) = failure.filter(|_| status == CarrierJobStatus::Failed) {
            self.record_failure(recipe.as_ref(), kind);
        }
        Ok(status)
    }

    async fn fetch_credentials(&self) -> Result<CarrierCredentials, QuoteError> {
        let tenant_id = self.job.tenant_id.as_str();
        let carrier_code = self.carrier.carrier_code.as_str();
        let credentials = &self.shared.credentials;
        let fetch = || credentials.get_credentials(tenant_id, carrier_code);

        let result = match fetch().await {
            Err(e) if !e.is_not_found() => {
                warn!("Credential store call failed, retrying: {}", e);
                self.shared.retry.run_infra("fetch_credentials", fetch).await
            }
            other => other,
        };

        result.map_err(|e| {
            if e.is_not_found() {
                QuoteError::credentials_invalid(format!(
                    "no credentials stored for carrier {}",
                    carrier_code
                ))
            } else {
                QuoteError::portal_unavailable(format!("credential store unavailable: {}", e))
            }
        })
    }

    async fn run_attempts(
        &self,
        agent: &dyn QuoteAgent,
        recipe: Option<&Recipe>,
        credentials: &CarrierCredentials,
        session: &BrowserSession,
        tracker: &CarrierProgressTracker,
    ) -> RetryOutcome<AttemptValue> {
        self.shared
            .retry
            .run(&self.cancel, |attempt| {
                self.attempt(attempt, agent, recipe, credentials, session, tracker)
                    .instrument(info_span!("attempt", attempt))
            })
            .await
    }

    async fn attempt(
        &self,
        attempt: u32,
        agent: &dyn QuoteAgent,
        recipe: Option<&Recipe>,
        credentials: &CarrierCredentials,
        session: &BrowserSession,
        tracker: &CarrierProgressTracker,
    ) -> Result<AttemptValue, QuoteError> {
        let store = &self.shared.store;
        let id = self.carrier.id.as_str();
        let retry = &self.shared.retry;
        let started = retry
            .run_infra("start_carrier_attempt", || async {
                store.start_carrier_attempt(id)
            })
            .await
            .map_err(store_failure)?;
        if !started {
            debug!("Carrier job already settled, skipping");
            return Ok(None);
        }
        let recipe_id = recipe.map(|r| r.id.as_str());
        retry
            .run_infra("set_carrier_recipe", || async {
                store.set_carrier_recipe(id, recipe_id)
            })
            .await
            .map_err(store_failure)?;
        tracker.started(attempt);

        let mut params = QuoteParams {
            job_id: self.job.id.clone(),
            carrier_job_id: id.to_string(),
            carrier_code: self.carrier.carrier_code.clone(),
            quote_type: self.job.quote_type,
            portal_url: self.shared.portals.get(&self.carrier.carrier_code).cloned(),
            client_data: self.client.as_ref().clone(),
            credentials: credentials.clone(),
            recipe: recipe.cloned(),
            session: session.clone(),
            captcha_solution: None,
            progress: Arc::new(CarrierProgress {
                store: store.clone(),
                carrier_job_id: id.to_string(),
                tracker: tracker.clone(),
            }),
            captcha: Arc::new(CarrierCaptcha {
                broker: self.shared.captcha.clone(),
                carrier_job_id: id.to_string(),
                tracker: tracker.clone(),
                cancel: self.cancel.clone(),
            }),
            cancel: self.cancel.clone(),
        };

        let first = self.run_agent(agent, &params).await;
        let result = match first {
            // The agent could not hand the CAPTCHA off itself: park, wait for
            // a human, then run once more with the answer.
            Err(e) if e.kind == ErrorKind::CaptchaFailed && !self.cancel.is_cancelled() => {
                let challenge = CaptchaChallenge {
                    kind: "unknown".to_string(),
                    prompt: Some(e.message.clone()),
                    ..Default::default()
                };
                tracker.captcha_needed(&e.message);
                let solution = self
                    .shared
                    .captcha
                    .await_solution(id, &challenge, &self.cancel)
                    .await?;
                tracker.resumed();
                params.captcha_solution = Some(solution);
                self.run_agent(agent, &params).await
            }
            other => other,
        };

        match result {
            Ok((data, discovered)) => Ok(Some((data, discovered))),
            Err(e) => {
                let will_retry = !self.cancel.is_cancelled()
                    && attempt - 1 < self.shared.retry.max_retries_for(e.kind);
                if will_retry {
                    tracker.retrying(attempt + 1, e.kind, &e.message);
                }
                Err(e)
            }
        }
    }

    async fn run_agent(
        &self,
        agent: &dyn QuoteAgent,
        params: &QuoteParams,
    ) -> Result<(QuoteResultData, Option<DiscoveredRecipe>), QuoteError> {
        tokio::select! {
            result = agent.execute_quote(params) => result.into_result(),
            _ = self.cancel.cancelled() => {
                agent.cancel().await;
                Err(QuoteError::unknown("execution cancelled"))
            }
        }
    }

    /// Writes the terminal state. A carrier job that settled elsewhere keeps
    /// its state; the status returned is whatever is persisted.
    fn settle(
        &self,
        outcome: CarrierOutcome,
        tracker: &CarrierProgressTracker,
    ) -> Result<CarrierJobStatus, StoreError> {
        if !self
            .shared
            .store
            .finish_carrier_job(&self.carrier.id, &outcome)?
        {
            return self.current_status();
        }

        match &outcome {
            CarrierOutcome::Completed { data, attempts, .. } => {
                info!(retries = attempts.len(), "Carrier quote completed");
                tracker.completed(data.premium);
            }
            CarrierOutcome::Failed { kind, message, .. } => {
                warn!(kind = %kind, "Carrier quote failed: {}", message);
                tracker.failed(*kind, message);
            }
            CarrierOutcome::Cancelled { .. } => {
                info!("Carrier quote cancelled");
                tracker.cancelled();
            }
        }
        Ok(outcome.status())
    }

    fn current_status(&self) -> Result<CarrierJobStatus, StoreError> {
        Ok(self
            .shared
            .store
            .get_carrier_job(&self.carrier.id)?
            .map(|c| c.status)
            .unwrap_or(self.carrier.status))
    }

    fn learn(&self, recipe: Option<&Recipe>, discovered: Option<DiscoveredRecipe>) {
        let store = &self.shared.store;
        let result = match (recipe, discovered.filter(|d| !d.is_empty())) {
            (Some(recipe), _) => store.record_recipe_outcome(&recipe.id, true).map(|_| ()),
            (None, Some(discovered)) => store
                .create_recipe_version(&self.carrier.carrier_code, self.job.quote_type, &discovered)
                .map(|_| ()),
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            warn!("Failed to update recipe cache: {}", e);
        }
    }

    fn record_failure(&self, recipe: Option<&Recipe>, kind: ErrorKind) {
        let Some(recipe) = recipe else {
            return;
        };
        let store = &self.shared.store;
        if let Err(e) = store.record_recipe_outcome(&recipe.id, false) {
            warn!("Failed to record recipe failure: {}", e);
        }
        if kind == ErrorKind::FormChanged {
            match store.flag_needs_validation(&recipe.id) {
                Ok(true) => info!(recipe_id = %recipe.id, "Recipe flagged for validation after form change"),
                Ok(false) => {}
                Err(e) => warn!("Failed to flag recipe: {}", e),
            }
        }
    }
}

fn failed(
    error: QuoteError,
    recipe_id: Option<String>,
    attempts: Vec<AttemptRecord>,
) -> CarrierOutcome {
    CarrierOutcome::Failed {
        kind: error.kind,
        message: error.message,
        recipe_id,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_is_retryable() {
        let error = store_failure(StoreError::NotFound {
            entity: "carrier job",
            id: "cj-1".to_string(),
        });
        assert_eq!(error.kind, ErrorKind::PortalUnavailable);
        assert!(error.kind.is_recoverable());
        assert!(error.message.contains("cj-1"));
    }
}
