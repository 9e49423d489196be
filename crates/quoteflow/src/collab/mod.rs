//! External collaborators the engine reads from: client-data sessions and
//! per-tenant carrier credentials.

pub mod client_data;
pub mod credentials;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::secrets::SecretError;

pub use client_data::{ClientDataProvider, HttpClientDataProvider};
pub use credentials::{CredentialStore, SqliteCredentialStore};

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Collaborator returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

impl CollaboratorError {
    /// Missing records are permanent; everything else may clear up on retry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CollaboratorError::NotFound { .. })
    }
}
