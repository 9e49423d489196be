//! Agent selection per carrier execution.

use std::sync::Arc;

use super::provider::AutomationProvider;
use super::remote::{RemoteAgentSettings, RemoteProviderAgent};
use super::QuoteAgent;
use crate::model::Recipe;

/// Builds a fresh agent for each carrier execution. An active recipe, when
/// present, selects the replay backend; otherwise the agent discovers.
pub trait AgentFactory: Send + Sync {
    fn create_agent(&self, carrier_code: &str, recipe: Option<&Recipe>) -> Arc<dyn QuoteAgent>;
}

/// Hands out [`RemoteProviderAgent`]s sharing one provider client.
pub struct RemoteAgentFactory {
    provider: Arc<dyn AutomationProvider>,
    settings: RemoteAgentSettings,
}

impl RemoteAgentFactory {
    pub fn new(provider: Arc<dyn AutomationProvider>, settings: RemoteAgentSettings) -> Self {
        Self { provider, settings }
    }
}

impl AgentFactory for RemoteAgentFactory {
    fn create_agent(&self, _carrier_code: &str, recipe: Option<&Recipe>) -> Arc<dyn QuoteAgent> {
        Arc::new(RemoteProviderAgent::new(
            self.provider.clone(),
            self.settings.clone(),
            recipe.is_some(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::provider::{ProviderError, TaskRequest, TaskStatus};
    use crate::model::{QuoteType, RecipeStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;

    struct Unused;

    #[async_trait]
    impl AutomationProvider for Unused {
        async fn create_task(&self, _r: &TaskRequest) -> Result<String, ProviderError> {
            Err(ProviderError::Transport("unused".to_string()))
        }
        async fn get_task_status(&self, _id: &str) -> Result<TaskStatus, ProviderError> {
            Err(ProviderError::Transport("unused".to_string()))
        }
        async fn cancel_task(&self, _id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn submit_captcha_solution(&self, _id: &str, _s: &str) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[test]
    fn test_recipe_selects_backend() {
        let factory = RemoteAgentFactory::new(Arc::new(Unused), RemoteAgentSettings::default());
        let recipe = Recipe {
            id: "r1".to_string(),
            carrier_code: "acme".to_string(),
            quote_type: QuoteType::Home,
            version: 1,
            steps: Vec::new(),
            field_mappings: BTreeMap::new(),
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            status: RecipeStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(factory.create_agent("acme", Some(&recipe)).name(), "remote/recipe");
        assert_eq!(factory.create_agent("acme", None).name(), "remote/discovery");
    }
}
