//! Builders for creating test data programmatically.

#![allow(dead_code)]

use std::collections::BTreeMap;

use quoteflow::model::{ClientData, DiscoveredRecipe, PersonalInfo, QuoteType, RecipeStep};
use quoteflow::store::NewJob;

pub const TENANT: &str = "tenant-1";
pub const SESSION: &str = "session-1";

/// Builder for `NewJob` requests.
pub struct JobBuilder {
    session_id: String,
    tenant_id: String,
    quote_type: QuoteType,
    carriers: Vec<String>,
    priority: i32,
}

impl JobBuilder {
    pub fn new(carriers: &[&str]) -> Self {
        Self {
            session_id: SESSION.to_string(),
            tenant_id: TENANT.to_string(),
            quote_type: QuoteType::Auto,
            carriers: carriers.iter().map(|c| c.to_string()).collect(),
            priority: 0,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn quote_type(mut self, quote_type: QuoteType) -> Self {
        self.quote_type = quote_type;
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn build(self) -> NewJob {
        NewJob {
            session_id: self.session_id,
            tenant_id: self.tenant_id,
            quote_type: self.quote_type,
            carriers: self.carriers,
            priority: self.priority,
        }
    }
}

pub fn sample_client_data() -> ClientData {
    let mut auto = BTreeMap::new();
    auto.insert("vin".to_string(), serde_json::json!("1HGCM82633A004352"));
    auto.insert("year".to_string(), serde_json::json!(2019));
    ClientData {
        personal: PersonalInfo {
            first_name: Some("Dana".to_string()),
            last_name: Some("Reyes".to_string()),
            email: Some("dana@example.com".to_string()),
            ..Default::default()
        },
        auto,
        ..Default::default()
    }
}

pub fn sample_recipe() -> DiscoveredRecipe {
    let mut field_mappings = BTreeMap::new();
    field_mappings.insert("personal.firstName".to_string(), "#first-name".to_string());
    DiscoveredRecipe {
        steps: vec![
            RecipeStep {
                action: "navigate".to_string(),
                target: Some("/quotes/new".to_string()),
                value_from: None,
                description: None,
            },
            RecipeStep {
                action: "fill".to_string(),
                target: Some("#first-name".to_string()),
                value_from: Some("personal.firstName".to_string()),
                description: None,
            },
        ],
        field_mappings,
    }
}
