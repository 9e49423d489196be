pub mod agent;
pub mod broadcast;
pub mod collab;
pub mod config;
pub mod db;
pub mod error;
pub(crate) mod http;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod secrets;
pub mod session;
pub mod store;
pub mod worker;

pub use agent::{AgentFactory, QuoteAgent, QuoteParams, RemoteAgentFactory};
pub use broadcast::{CarrierPhase, CarrierProgressEvent, ProgressBroadcaster};
pub use config::{load_config, Config};
pub use db::Database;
pub use error::{ConfigError, QuoteflowError, Result};
pub use model::{
    CarrierJob, CarrierJobStatus, ClientData, Job, JobStatus, QuoteResultData, QuoteType, Recipe,
    RecipeStatus,
};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
pub use queue::{JobQueue, SqliteJobQueue};
pub use retry::{ErrorKind, QuoteError, RetryPolicy};
pub use secrets::{CredentialCipher, SecretError, SecretRef};
pub use session::{BrowserSessionManager, SessionLease};
pub use store::{JobStatusReport, JobStore, NewJob, StoreError};
pub use worker::WorkerPool;
