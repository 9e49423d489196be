//! HTTP client for a remote browser-session provider.
//!
//! `POST {base}/v1/sessions` creates a session, `DELETE
//! {base}/v1/sessions/{id}` destroys it.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{BrowserSession, BrowserSessionProvider, SessionError};
use crate::http::{create_http_client, join_url, sanitize_error_body};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    id: String,
    #[serde(default, alias = "connect_url", alias = "wsEndpoint")]
    connect_url: Option<String>,
}

pub struct HttpBrowserSessionProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpBrowserSessionProvider {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, SessionError> {
        let client = create_http_client()
            .map_err(|e| SessionError::Provider(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl BrowserSessionProvider for HttpBrowserSessionProvider {
    async fn create_session(&self) -> Result<BrowserSession, SessionError> {
        let response = self
            .client
            .post(join_url(&self.base_url, "v1/sessions"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| SessionError::Provider(format!("Session create request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::Provider(format!(
                "Session create returned {}: {}",
                status,
                sanitize_error_body(&body)
            )));
        }

        let created: CreateSessionResponse = response.json().await.map_err(|e| {
            SessionError::Provider(format!("Failed to parse session response: {}", e))
        })?;
        debug!(session_id = %created.id, "remote browser session created");

        Ok(BrowserSession {
            id: created.id,
            connect_url: created.connect_url,
            created_at: Utc::now(),
        })
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), SessionError> {
        let response = self
            .client
            .delete(join_url(
                &self.base_url,
                &format!("v1/sessions/{}", session_id),
            ))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| SessionError::Provider(format!("Session delete request failed: {}", e)))?;

        let status = response.status();
        // Already gone counts as destroyed.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SessionError::Provider(format!(
            "Session delete returned {}: {}",
            status,
            sanitize_error_body(&body)
        )))
    }
}
