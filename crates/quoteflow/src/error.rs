use std::path::PathBuf;
use thiserror::Error;

use crate::agent::ProviderError;
use crate::collab::CollaboratorError;
use crate::db::DatabaseError;
use crate::queue::QueueError;
use crate::secrets::SecretError;
use crate::session::SessionError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum QuoteflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Automation provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

pub type Result<T> = std::result::Result<T, QuoteflowError>;
