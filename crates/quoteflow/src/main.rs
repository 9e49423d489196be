use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use quoteflow::agent::{HttpAutomationProvider, RemoteAgentFactory, RemoteAgentSettings};
use quoteflow::collab::{HttpClientDataProvider, SqliteCredentialStore};
use quoteflow::config::Config;
use quoteflow::logging::init_logging;
use quoteflow::session::HttpBrowserSessionProvider;
use quoteflow::{
    load_config, BrowserSessionManager, Collaborators, CredentialCipher, Database, JobStore,
    Orchestrator, OrchestratorSettings, ProgressBroadcaster, QuoteflowError, Result,
    SqliteJobQueue, WorkerPool,
};

const CONFIG_ENV_VAR: &str = "QUOTEFLOW_CONFIG";

/// First argument, then `$QUOTEFLOW_CONFIG`, then `~/.quoteflow/config.json`.
fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".quoteflow").join("config.json")))
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let db_path = config
        .resolved_database_path()
        .ok_or_else(|| QuoteflowError::Worker("cannot determine database path".to_string()))?;
    let db = Database::open(&db_path)?;
    info!("Using database at {:?}", db_path);

    let store = JobStore::new(db.clone()).with_demotion_rule(config.demotion_rule());
    let queue = SqliteJobQueue::new(db.clone())
        .with_visibility_timeout(config.queue.visibility_timeout())
        .with_poll_interval(config.queue.poll_interval());

    let session_provider = HttpBrowserSessionProvider::new(
        &config.sessions.provider_url,
        config.sessions.api_key.resolve()?,
    )?;
    let sessions = BrowserSessionManager::new(Arc::new(session_provider), config.sessions.max_sessions)
        .with_acquire_timeout(config.sessions.acquire_timeout());

    let automation = HttpAutomationProvider::new(
        &config.automation.provider_url,
        config.automation.api_key.resolve()?,
    )?;
    let agents = RemoteAgentFactory::new(
        Arc::new(automation),
        RemoteAgentSettings {
            poll_interval: config.automation.poll_interval(),
            task_timeout: config.automation.task_timeout(),
        },
    );

    let client_data_key = match &config.client_data.api_key {
        Some(key) => key.resolve_optional()?,
        None => None,
    };
    let client_data = HttpClientDataProvider::new(&config.client_data.base_url, client_data_key)?;

    let cipher = CredentialCipher::from_secret(&config.credentials.encryption_key.resolve()?)?;
    let credentials = SqliteCredentialStore::new(db, cipher);

    Ok(Orchestrator::new(
        Collaborators {
            store,
            queue: Arc::new(queue),
            sessions,
            agents: Arc::new(agents),
            client_data: Arc::new(client_data),
            credentials: Arc::new(credentials),
            progress: ProgressBroadcaster::default(),
        },
        OrchestratorSettings {
            retry: config.retry_policy(),
            max_concurrent_carriers: config.max_concurrent_carriers,
            portals: config.automation.portals.clone(),
            ..Default::default()
        },
    ))
}

async fn run() -> Result<()> {
    let path = config_path()
        .ok_or_else(|| QuoteflowError::Worker("no configuration file given".to_string()))?;
    let config = load_config(&path)?;
    init_logging(&config.logging)?;

    info!(
        "Starting quoteflow worker v{} with config {:?}",
        env!("CARGO_PKG_VERSION"),
        path
    );

    let orchestrator = build_orchestrator(&config)?;
    let pool = WorkerPool::start(
        orchestrator.clone(),
        config.worker_count,
        config.queue.dequeue_wait(),
    )
    .await?;

    let shutdown = pool.shutdown_token();
    ctrlc::set_handler(move || {
        info!("Received interrupt, finishing in-flight jobs");
        shutdown.cancel();
    })
    .map_err(|e| QuoteflowError::Worker(format!("failed to install signal handler: {}", e)))?;

    pool.wait().await;
    orchestrator.sessions().close();
    info!("Worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be up yet when the config itself is broken.
        eprintln!("quoteflow-worker: {}", e);
        error!("{}", e);
        std::process::exit(1);
    }
}
