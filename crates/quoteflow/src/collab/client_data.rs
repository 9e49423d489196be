//! Read-only access to client-data sessions.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};

use super::CollaboratorError;
use crate::http::{create_http_client, join_url, sanitize_error_body};
use crate::model::ClientData;

#[async_trait]
pub trait ClientDataProvider: Send + Sync {
    /// Fetches the structured client fields of one session.
    async fn fetch_client_data(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<ClientData, CollaboratorError>;
}

/// `GET {base}/api/v1/sessions/{id}/client-data`, scoped by tenant header.
pub struct HttpClientDataProvider {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpClientDataProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, CollaboratorError> {
        let client = create_http_client().map_err(|e| {
            CollaboratorError::Transport(format!("Failed to create HTTP client: {}", e))
        })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn session_url(&self, session_id: &str) -> String {
        join_url(
            &self.base_url,
            &format!("api/v1/sessions/{}/client-data", session_id),
        )
    }
}

#[async_trait]
impl ClientDataProvider for HttpClientDataProvider {
    async fn fetch_client_data(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<ClientData, CollaboratorError> {
        let mut request = self
            .client
            .get(self.session_url(session_id))
            .header("X-Tenant-Id", tenant_id);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CollaboratorError::NotFound {
                what: "client data session",
                id: session_id.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body: sanitize_error_body(&body),
            });
        }

        response
            .json::<ClientData>()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url() {
        let provider = HttpClientDataProvider::new("https://app.test/", None).unwrap();
        assert_eq!(
            provider.session_url("s-1"),
            "https://app.test/api/v1/sessions/s-1/client-data"
        );
    }

    #[test]
    fn test_client_data_wire_format() {
        let json = r#"{
            "personal": {"firstName": "Dana", "dateOfBirth": "1990-04-01"},
            "auto": {"vin": "1HGCM82633A004352"},
            "drivers": [{"name": "Dana", "licenseState": "CA"}]
        }"#;
        let data: ClientData = serde_json::from_str(json).unwrap();
        assert_eq!(data.personal.first_name.as_deref(), Some("Dana"));
        assert_eq!(data.lookup("auto.vin").as_deref(), Some("1HGCM82633A004352"));
        assert!(data.property.is_empty());
        assert_eq!(data.drivers.len(), 1);
    }

    #[test]
    fn test_not_found_is_permanent() {
        let err = CollaboratorError::NotFound {
            what: "client data session",
            id: "s-1".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!CollaboratorError::Transport("reset".to_string()).is_not_found());
    }
}
