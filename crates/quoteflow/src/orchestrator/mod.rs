//! Job orchestration: admission, per-job fan-out to carriers, cancellation,
//! CAPTCHA relay and crash recovery.
//!
//! Every job is processed from a queue delivery. The delivery is acked only
//! once the job is terminal, so a crash anywhere before that point leads to
//! redelivery, and the guarded store transitions make the replay skip any
//! carrier that already settled.

pub mod captcha;
mod executor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::agent::AgentFactory;
use crate::broadcast::ProgressBroadcaster;
use crate::collab::{ClientDataProvider, CollaboratorError, CredentialStore};
use crate::error::{QuoteflowError, Result};
use crate::model::{CarrierOutcome, ClientData, Job, JobStatus};
use crate::queue::{Delivery, JobQueue};
use crate::retry::{QuoteError, RetryPolicy};
use crate::session::BrowserSessionManager;
use crate::store::{JobFilter, JobStatusReport, JobStore, NewJob};

use captcha::{CaptchaBroker, DEFAULT_SOLUTION_POLL_INTERVAL};
use executor::CarrierRun;

/// Upper bound on how long a cancel requested from another process goes
/// unnoticed by the worker running the job.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Services the orchestrator drives.
pub struct Collaborators {
    pub store: JobStore,
    pub queue: Arc<dyn JobQueue>,
    pub sessions: BrowserSessionManager,
    pub agents: Arc<dyn AgentFactory>,
    pub client_data: Arc<dyn ClientDataProvider>,
    pub credentials: Arc<dyn CredentialStore>,
    pub progress: ProgressBroadcaster,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    /// Carrier executions allowed at once across all jobs.
    pub max_concurrent_carriers: usize,
    /// Portal entry URL per carrier code.
    pub portals: HashMap<String, String>,
    pub captcha_poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_carriers: num_cpus::get() * 2,
            portals: HashMap::new(),
            captcha_poll_interval: DEFAULT_SOLUTION_POLL_INTERVAL,
        }
    }
}

pub(crate) struct Shared {
    pub store: JobStore,
    pub queue: Arc<dyn JobQueue>,
    pub sessions: BrowserSessionManager,
    pub agents: Arc<dyn AgentFactory>,
    pub client_data: Arc<dyn ClientDataProvider>,
    pub credentials: Arc<dyn CredentialStore>,
    pub progress: ProgressBroadcaster,
    pub captcha: CaptchaBroker,
    pub retry: RetryPolicy,
    pub portals: HashMap<String, String>,
    pub carrier_slots: Arc<Semaphore>,
    /// Cancellation handles for jobs executing in this process.
    running: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, settings: OrchestratorSettings) -> Self {
        let captcha = CaptchaBroker::new(collaborators.store.clone())
            .with_poll_interval(settings.captcha_poll_interval);
        Self {
            shared: Arc::new(Shared {
                store: collaborators.store,
                queue: collaborators.queue,
                sessions: collaborators.sessions,
                agents: collaborators.agents,
                client_data: collaborators.client_data,
                credentials: collaborators.credentials,
                progress: collaborators.progress,
                captcha,
                retry: settings.retry,
                portals: settings.portals,
                carrier_slots: Arc::new(Semaphore::new(settings.max_concurrent_carriers.max(1))),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.shared.store
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.shared.progress
    }

    pub fn sessions(&self) -> &BrowserSessionManager {
        &self.shared.sessions
    }

    /// Creates the job with one pending carrier job per carrier and admits
    /// it to the queue. If the queue stays unavailable the job remains
    /// pending and is picked up again by [`Orchestrator::recover`].
    pub async fn submit_job(&self, new: NewJob) -> Result<Job> {
        let shared = &self.shared;
        let job = shared.store.create_job(&new)?;

        let queue = &shared.queue;
        shared
            .retry
            .run_infra("enqueue", || queue.enqueue(&job.id, job.priority))
            .await?;
        shared.store.mark_queued(&job.id)?;

        info!(
            job_id = %job.id,
            carriers = job.carriers_total,
            priority = job.priority,
            "Job submitted"
        );
        Ok(shared.store.require_job(&job.id)?)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<JobStatusReport> {
        self.shared
            .store
            .get_status(job_id)?
            .ok_or_else(|| QuoteflowError::JobNotFound(job_id.to_string()))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64)> {
        Ok(self.shared.store.list_jobs(filter)?)
    }

    /// Requests cancellation. Carriers not yet settled end as cancelled;
    /// carriers that already completed keep their results. Returns false
    /// when the job had already finished.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let store = &self.shared.store;
        let job = store
            .get_job(job_id)?
            .ok_or_else(|| QuoteflowError::JobNotFound(job_id.to_string()))?;
        if job.is_finished() || !store.request_cancel(job_id)? {
            return Ok(false);
        }
        info!(job_id, "Cancellation requested");

        let executing_here = self.running_token(job_id).map(|t| t.cancel()).is_some();
        if !executing_here && matches!(job.status, JobStatus::Pending | JobStatus::Queued) {
            self.cancel_unsettled(job_id)?;
            store.finalize_job(job_id)?;
        }
        Ok(true)
    }

    /// Hands a human-entered CAPTCHA solution to the parked carrier job.
    /// Returns false if that carrier job is not waiting for one.
    pub fn resolve_captcha(&self, carrier_job_id: &str, solution: &str) -> Result<bool> {
        let solution = solution.trim();
        if solution.is_empty() {
            return Ok(false);
        }
        Ok(self.shared.captcha.submit_solution(carrier_job_id, solution)?)
    }

    /// Re-offers every non-terminal job to the queue. Jobs that still have a
    /// queue entry are unaffected. Returns how many jobs were re-offered.
    pub async fn recover(&self) -> Result<usize> {
        let shared = &self.shared;
        let queue = &shared.queue;
        let mut count = 0;

        for status in [JobStatus::Pending, JobStatus::Queued, JobStatus::Running] {
            for job_id in shared.store.job_ids_with_status(status)? {
                let Some(job) = shared.store.get_job(&job_id)? else {
                    continue;
                };
                shared
                    .retry
                    .run_infra("enqueue", || queue.enqueue(&job.id, job.priority))
                    .await?;
                shared.store.mark_queued(&job.id)?;
                count += 1;
            }
        }

        if count > 0 {
            info!(jobs = count, "Recovered unfinished jobs");
        }
        Ok(count)
    }

    /// Takes one job off the queue and runs it to completion. Returns false
    /// when nothing became available within `wait`.
    pub async fn process_next(&self, wait: Duration) -> Result<bool> {
        let Some(delivery) = self.next_delivery(wait).await? else {
            return Ok(false);
        };
        self.process_delivery(&delivery).await?;
        Ok(true)
    }

    /// Leases the next job without running it.
    pub async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>> {
        Ok(self.shared.queue.dequeue(wait).await?)
    }

    /// Runs the delivered job. An error leaves the delivery unacknowledged
    /// so the queue hands it out again.
    pub async fn process_delivery(&self, delivery: &Delivery) -> Result<()> {
        let span = info_span!(
            "job",
            job_id = %delivery.job_id,
            delivery = delivery.delivery_count
        );
        self.process_delivery_inner(delivery).instrument(span).await
    }

    async fn process_delivery_inner(&self, delivery: &Delivery) -> Result<()> {
        let Some(job) = self.shared.store.get_job(&delivery.job_id)? else {
            warn!("Dropping queue entry for unknown job");
            self.ack(delivery).await;
            return Ok(());
        };
        if job.is_finished() {
            debug!(status = %job.status, "Job already finished, acknowledging");
            self.ack(delivery).await;
            return Ok(());
        }
        if self.running_token(&job.id).is_some() {
            debug!("Job is already executing in this process");
            return Ok(());
        }
        if delivery.is_redelivery() {
            info!("Resuming redelivered job");
        }

        let token = CancellationToken::new();
        self.register(&job.id, token.clone());
        let (stop, heartbeat) = self.spawn_heartbeat(delivery.clone(), token.clone());

        let result = self.run_job(job, &token).await;

        stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        self.unregister(&delivery.job_id);

        match result? {
            Some(status) => {
                info!(status = %status, "Job finished");
                self.ack(delivery).await;
            }
            None => warn!("Job left unfinished, leaving it for redelivery"),
        }
        Ok(())
    }

    async fn run_job(&self, job: Job, token: &CancellationToken) -> Result<Option<JobStatus>> {
        let shared = &self.shared;
        if job.cancel_requested {
            token.cancel();
        }
        if token.is_cancelled() {
            self.cancel_unsettled(&job.id)?;
            return Ok(shared.store.finalize_job(&job.id)?);
        }

        let client = match self.fetch_client_data(&job).await {
            Ok(client) => client,
            Err(e) if e.is_not_found() => {
                warn!("Client data unavailable, failing all carriers: {}", e);
                self.fail_unsettled(&job.id, &QuoteError::unknown(e.to_string()))?;
                return Ok(shared.store.finalize_job(&job.id)?);
            }
            Err(e) => return Err(e.into()),
        };

        shared.store.mark_job_running(&job.id)?;
        let carriers: Vec<_> = shared
            .store
            .carrier_jobs(&job.id)?
            .into_iter()
            .filter(|c| !c.is_finished())
            .collect();
        info!(carriers = carriers.len(), "Dispatching carriers");

        let job = Arc::new(job);
        let client = Arc::new(client);
        let mut units = JoinSet::new();
        for carrier in carriers {
            let run = CarrierRun {
                shared: Arc::clone(shared),
                job: Arc::clone(&job),
                client: Arc::clone(&client),
                carrier,
                cancel: token.child_token(),
            };
            units.spawn(run.execute());
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(Ok(status)) => trace!(status = %status, "Carrier unit finished"),
                Ok(Err(e)) => error!("Carrier unit hit a store error: {}", e),
                Err(e) => error!("Carrier unit aborted: {}", e),
            }
        }

        // Units that panicked or could not write their result.
        if token.is_cancelled() {
            self.cancel_unsettled(&job.id)?;
        } else {
            self.fail_unsettled(
                &job.id,
                &QuoteError::unknown("carrier execution ended without a result"),
            )?;
        }
        Ok(shared.store.finalize_job(&job.id)?)
    }

    async fn fetch_client_data(&self, job: &Job) -> std::result::Result<ClientData, CollaboratorError> {
        let client_data = &self.shared.client_data;
        let fetch = || client_data.fetch_client_data(&job.tenant_id, &job.session_id);
        match fetch().await {
            Err(e) if !e.is_not_found() => {
                warn!("Client data fetch failed, retrying: {}", e);
                self.shared.retry.run_infra("fetch_client_data", fetch).await
            }
            other => other,
        }
    }

    fn cancel_unsettled(&self, job_id: &str) -> Result<()> {
        let store = &self.shared.store;
        for carrier in store.carrier_jobs(job_id)? {
            if carrier.is_finished() {
                continue;
            }
            let outcome = CarrierOutcome::Cancelled {
                attempts: carrier.attempts.clone(),
            };
            if store.finish_carrier_job(&carrier.id, &outcome)? {
                self.shared
                    .progress
                    .tracker(job_id, &carrier.id, &carrier.carrier_code)
                    .cancelled();
            }
        }
        Ok(())
    }

    fn fail_unsettled(&self, job_id: &str, error: &QuoteError) -> Result<()> {
        let store = &self.shared.store;
        for carrier in store.carrier_jobs(job_id)? {
            if carrier.is_finished() {
                continue;
            }
            let outcome = CarrierOutcome::Failed {
                kind: error.kind,
                message: error.message.clone(),
                recipe_id: carrier.recipe_id.clone(),
                attempts: carrier.attempts.clone(),
            };
            if store.finish_carrier_job(&carrier.id, &outcome)? {
                self.shared
                    .progress
                    .tracker(job_id, &carrier.id, &carrier.carrier_code)
                    .failed(error.kind, &error.message);
            }
        }
        Ok(())
    }

    /// Keeps the queue lease alive while the job runs and picks up cancel
    /// requests made through another process.
    fn spawn_heartbeat(
        &self,
        delivery: Delivery,
        job_token: CancellationToken,
    ) -> (CancellationToken, JoinHandle<()>) {
        let stop = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let extend_every = (shared.queue.visibility_timeout() / 3).max(Duration::from_millis(100));
        let tick = extend_every.min(CANCEL_POLL_INTERVAL);

        let handle = tokio::spawn({
            let stop = stop.clone();
            async move {
                let mut since_extend = Duration::ZERO;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(tick) => {}
                    }

                    since_extend += tick;
                    if since_extend >= extend_every {
                        since_extend = Duration::ZERO;
                        match shared.queue.extend_visibility(&delivery).await {
                            Ok(true) => trace!(job_id = %delivery.job_id, "Lease extended"),
                            Ok(false) => warn!(job_id = %delivery.job_id, "Queue lease lost"),
                            Err(e) => warn!(job_id = %delivery.job_id, "Failed to extend lease: {}", e),
                        }
                    }

                    match shared.store.is_cancel_requested(&delivery.job_id) {
                        Ok(true) if !job_token.is_cancelled() => {
                            info!(job_id = %delivery.job_id, "Cancel request picked up");
                            job_token.cancel();
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Failed to check cancel flag: {}", e),
                    }
                }
            }
        });
        (stop, handle)
    }

    async fn ack(&self, delivery: &Delivery) {
        let queue = &self.shared.queue;
        match self
            .shared
            .retry
            .run_infra("ack", || queue.ack(delivery))
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("Lease already lapsed; redelivery will be a no-op"),
            Err(e) => warn!("Failed to acknowledge delivery: {}", e),
        }
    }

    fn running_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.shared
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(job_id).cloned())
    }

    fn register(&self, job_id: &str, token: CancellationToken) {
        if let Ok(mut running) = self.shared.running.lock() {
            running.insert(job_id.to_string(), token);
        }
    }

    fn unregister(&self, job_id: &str) {
        if let Ok(mut running) = self.shared.running.lock() {
            running.remove(job_id);
        }
    }
}
