//! Cached, versioned procedures for a carrier's quote flow.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::QuoteType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipeStatus {
    Active,
    NeedsValidation,
    Deprecated,
}

impl RecipeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipeStatus::Active => "active",
            RecipeStatus::NeedsValidation => "needs_validation",
            RecipeStatus::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RecipeStatus::Active),
            "needs_validation" => Some(RecipeStatus::NeedsValidation),
            "deprecated" => Some(RecipeStatus::Deprecated),
            _ => None,
        }
    }
}

impl fmt::Display for RecipeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single portal interaction, e.g. `fill #first-name from personal.firstName`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecipeStep {
    /// navigate, click, fill, select, wait, extract...
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Dotted client-data path supplying the value, e.g. `auto.vin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl fmt::Display for RecipeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;
        if let Some(target) = &self.target {
            write!(f, " {}", target)?;
        }
        if let Some(source) = &self.value_from {
            write!(f, " from {}", source)?;
        }
        if let Some(desc) = &self.description {
            write!(f, " ({})", desc)?;
        }
        Ok(())
    }
}

/// Steps and field mapping reported by a successful discovery run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredRecipe {
    #[serde(default)]
    pub steps: Vec<RecipeStep>,
    /// Client-data field path -> portal form field.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
}

impl DiscoveredRecipe {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    pub carrier_code: String,
    pub quote_type: QuoteType,
    pub version: u32,
    pub steps: Vec<RecipeStep>,
    pub field_mappings: BTreeMap<String, String>,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    pub status: RecipeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipe {
    pub fn total_runs(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn failure_rate(&self) -> f64 {
        match self.total_runs() {
            0 => 0.0,
            total => self.failure_count as f64 / total as f64,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RecipeStatus::Active
    }
}

/// When an active recipe should be demoted to `needs_validation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemotionRule {
    pub failure_rate_threshold: f64,
    pub min_runs: u64,
}

impl Default for DemotionRule {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_runs: 4,
        }
    }
}

impl DemotionRule {
    pub fn should_demote(&self, recipe: &Recipe) -> bool {
        recipe.is_active()
            && recipe.total_runs() >= self.min_runs
            && recipe.failure_rate() > self.failure_rate_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(success: u64, failure: u64) -> Recipe {
        Recipe {
            id: "r1".to_string(),
            carrier_code: "acme".to_string(),
            quote_type: QuoteType::Auto,
            version: 1,
            steps: vec![],
            field_mappings: BTreeMap::new(),
            success_count: success,
            failure_count: failure,
            last_success_at: None,
            last_failure_at: None,
            status: RecipeStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_failure_rate() {
        assert_eq!(recipe(0, 0).failure_rate(), 0.0);
        assert_eq!(recipe(3, 1).failure_rate(), 0.25);
    }

    #[test]
    fn test_demotion_requires_min_runs() {
        let rule = DemotionRule::default();
        assert!(!rule.should_demote(&recipe(0, 3)));
        assert!(rule.should_demote(&recipe(1, 3)));
        assert!(!rule.should_demote(&recipe(2, 2)));
    }

    #[test]
    fn test_demotion_ignores_inactive() {
        let rule = DemotionRule::default();
        let mut r = recipe(0, 10);
        r.status = RecipeStatus::Deprecated;
        assert!(!rule.should_demote(&r));
    }

    #[test]
    fn test_step_display() {
        let step = RecipeStep {
            action: "fill".to_string(),
            target: Some("#zip".to_string()),
            value_from: Some("property.zip".to_string()),
            description: None,
        };
        assert_eq!(step.to_string(), "fill #zip from property.zip");
    }
}
