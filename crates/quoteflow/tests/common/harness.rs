//! Test harness for isolated orchestrator runs.
//!
//! The `TestHarness` wires an [`Orchestrator`] over an in-memory database
//! and the scripted fakes, so a test can submit jobs, drive the queue one
//! delivery at a time and inspect persisted state.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use quoteflow::broadcast::ProgressBroadcaster;
use quoteflow::model::{CarrierJob, CarrierJobStatus, Job};
use quoteflow::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use quoteflow::queue::SqliteJobQueue;
use quoteflow::retry::RetryPolicy;
use quoteflow::session::{BrowserSessionManager, SessionStats};
use quoteflow::store::{JobStatusReport, JobStore, NewJob};
use quoteflow::Database;

use super::fakes::{FakeClientData, FakeCredentials, FakeSessions, ScriptedAgents};

pub struct TestHarness {
    pub db: Database,
    pub store: JobStore,
    pub queue: Arc<SqliteJobQueue>,
    pub orchestrator: Orchestrator,
    pub agents: Arc<ScriptedAgents>,
    pub sessions: Arc<FakeSessions>,
    pub client_data: Arc<FakeClientData>,
    pub credentials: Arc<FakeCredentials>,
}

pub struct HarnessBuilder {
    max_sessions: usize,
    max_concurrent_carriers: usize,
    retry: RetryPolicy,
}

impl HarnessBuilder {
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn max_concurrent_carriers(mut self, max: usize) -> Self {
        self.max_concurrent_carriers = max;
        self
    }

    pub fn build(self) -> TestHarness {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let store = JobStore::new(db.clone());
        let queue = Arc::new(
            SqliteJobQueue::new(db.clone()).with_poll_interval(Duration::from_millis(10)),
        );
        let agents = Arc::new(ScriptedAgents::default());
        let sessions = Arc::new(FakeSessions::default());
        let client_data = Arc::new(FakeClientData::default());
        let credentials = Arc::new(FakeCredentials::default());

        let orchestrator = Orchestrator::new(
            Collaborators {
                store: store.clone(),
                queue: queue.clone(),
                sessions: BrowserSessionManager::new(sessions.clone(), self.max_sessions),
                agents: agents.clone(),
                client_data: client_data.clone(),
                credentials: credentials.clone(),
                progress: ProgressBroadcaster::default(),
            },
            OrchestratorSettings {
                retry: self.retry,
                max_concurrent_carriers: self.max_concurrent_carriers,
                captcha_poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );

        TestHarness {
            db,
            store,
            queue,
            orchestrator,
            agents,
            sessions,
            client_data,
            credentials,
        }
    }
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            max_sessions: 4,
            max_concurrent_carriers: 8,
            retry: RetryPolicy::default(),
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn submit(&self, new: NewJob) -> Job {
        self.orchestrator
            .submit_job(new)
            .await
            .expect("Failed to submit job")
    }

    /// Processes one queued job to completion.
    pub async fn process_one(&self) -> bool {
        self.orchestrator
            .process_next(Duration::ZERO)
            .await
            .expect("Failed to process job")
    }

    pub fn status(&self, job_id: &str) -> JobStatusReport {
        self.orchestrator
            .get_job_status(job_id)
            .expect("Failed to read job status")
    }

    pub fn carrier(&self, job_id: &str, carrier_code: &str) -> CarrierJob {
        self.status(job_id)
            .carrier(carrier_code)
            .cloned()
            .unwrap_or_else(|| panic!("No carrier job for {}", carrier_code))
    }

    pub fn session_stats(&self) -> Arc<SessionStats> {
        self.orchestrator.sessions().stats()
    }

    /// Polls until the carrier job reaches `status`, failing after ~5s.
    pub async fn wait_for_carrier(
        &self,
        job_id: &str,
        carrier_code: &str,
        status: CarrierJobStatus,
    ) -> CarrierJob {
        for _ in 0..500 {
            let carrier = self.carrier(job_id, carrier_code);
            if carrier.status == status {
                return carrier;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Carrier {} never reached {}", carrier_code, status);
    }
}
