//! Client data in, quote results out.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::recipe::DiscoveredRecipe;
use crate::retry::QuoteError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersonalInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
}

impl PersonalInfo {
    pub fn full_name(&self) -> Option<String> {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.trim().is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

/// Structured client fields used to populate carrier forms.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    #[serde(default)]
    pub personal: PersonalInfo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auto: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drivers: Vec<BTreeMap<String, serde_json::Value>>,
}

impl ClientData {
    /// Resolves a dotted path such as `personal.firstName` or `auto.vin`.
    pub fn lookup(&self, path: &str) -> Option<String> {
        let value = serde_json::to_value(self).ok()?;
        let mut current = &value;
        for segment in path.split('.') {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Decrypted portal credentials. Never persisted by the engine.
#[derive(Debug, Clone)]
pub struct CarrierCredentials {
    pub username: String,
    pub password: SecretString,
    pub mfa_code: Option<SecretString>,
}

/// Challenge handed to a human when a portal presents a CAPTCHA.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaChallenge {
    /// recaptcha, hcaptcha, image, text...
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
}

/// Extracted quote. Any field may be missing; partial data is still a success.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResultData {
    /// Annual premium as a plain amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium_monthly: Option<f64>,
    #[serde(default)]
    pub coverages: BTreeMap<String, String>,
    #[serde(default)]
    pub deductibles: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,
}

/// Outcome of one agent execution.
#[derive(Debug, Clone, Default)]
pub struct QuoteResult {
    pub success: bool,
    pub data: Option<QuoteResultData>,
    pub error: Option<QuoteError>,
    pub screenshots: Vec<String>,
    /// Steps a discovery run took, used to learn a recipe.
    pub discovered: Option<DiscoveredRecipe>,
}

impl QuoteResult {
    pub fn success(data: QuoteResultData) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failure(error: QuoteError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_screenshots(mut self, screenshots: Vec<String>) -> Self {
        self.screenshots = screenshots;
        self
    }

    pub fn with_discovered(mut self, discovered: Option<DiscoveredRecipe>) -> Self {
        self.discovered = discovered;
        self
    }

    /// Collapses the result into data or a classified error.
    pub fn into_result(self) -> Result<(QuoteResultData, Option<DiscoveredRecipe>), QuoteError> {
        if self.success {
            Ok((self.data.unwrap_or_default(), self.discovered))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| QuoteError::unknown("agent reported failure without an error")))
        }
    }
}
