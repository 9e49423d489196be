use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::default_database_path;
use crate::model::DemotionRule;
use crate::retry::RetryPolicy;
use crate::secrets::{expand_home, SecretRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.quoteflow/data/quoteflow.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Carrier executions in flight across all jobs.
    #[serde(default = "default_max_concurrent_carriers")]
    pub max_concurrent_carriers: usize,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub sessions: SessionsConfig,
    pub automation: AutomationConfig,
    #[serde(default)]
    pub recipes: RecipesConfig,
    pub client_data: ClientDataConfig,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_worker_count() -> usize {
    2
}

fn default_max_concurrent_carriers() -> usize {
    num_cpus::get() * 2
}

impl Config {
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        match self.database_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => Some(expand_home(path)),
            None => default_database_path(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    pub fn demotion_rule(&self) -> DemotionRule {
        DemotionRule {
            failure_rate_threshold: self.recipes.failure_rate_threshold,
            min_runs: self.recipes.min_runs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long an idle worker blocks in one dequeue call.
    #[serde(default = "default_dequeue_wait_secs")]
    pub dequeue_wait_secs: u64,
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_queue_poll_interval_ms() -> u64 {
    500
}

fn default_dequeue_wait_secs() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_interval_ms: default_queue_poll_interval_ms(),
            dequeue_wait_secs: default_dequeue_wait_secs(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_secs(self.dequeue_wait_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> Vec<u64> {
    vec![2, 4, 8]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub provider_url: String,
    pub api_key: SecretRef,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_sessions() -> usize {
    8
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

impl SessionsConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub provider_url: String,
    pub api_key: SecretRef,
    #[serde(default = "default_provider_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Carrier code -> agent portal login URL.
    #[serde(default)]
    pub portals: HashMap<String, String>,
}

fn default_provider_poll_interval_secs() -> u64 {
    2
}

fn default_task_timeout_secs() -> u64 {
    600
}

impl AutomationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipesConfig {
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    #[serde(default = "default_min_runs")]
    pub min_runs: u64,
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_min_runs() -> u64 {
    4
}

impl Default for RecipesConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            min_runs: default_min_runs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDataConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<SecretRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// 64 hex characters (AES-256).
    pub encryption_key: SecretRef,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
