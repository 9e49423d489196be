//! Recipe cache operations on the job store.

use chrono::Utc;

use super::{decode, encode, parse_timestamp, JobStore, StoreError};
use crate::db::recipe_repo::{self, RecipeRow};
use crate::db::{format_timestamp, now_timestamp, DatabaseError};
use crate::model::{DiscoveredRecipe, QuoteType, Recipe, RecipeStatus};

fn recipe_from_row(row: RecipeRow) -> Result<Recipe, DatabaseError> {
    let quote_type = QuoteType::parse(&row.quote_type).ok_or_else(|| DatabaseError::CorruptRow {
        table: "recipes",
        reason: format!("unknown quote type '{}' for {}", row.quote_type, row.id),
    })?;
    let status = RecipeStatus::parse(&row.status).unwrap_or_else(|| {
        log::warn!(
            "Unknown recipe status '{}' for {}, defaulting to needs_validation",
            row.status,
            row.id
        );
        RecipeStatus::NeedsValidation
    });

    Ok(Recipe {
        steps: decode("steps", &row.steps)?,
        field_mappings: decode("field_mappings", &row.field_mappings)?,
        last_success_at: row.last_success_at.as_deref().map(parse_timestamp),
        last_failure_at: row.last_failure_at.as_deref().map(parse_timestamp),
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        id: row.id,
        carrier_code: row.carrier_code,
        quote_type,
        version: row.version,
        success_count: row.success_count,
        failure_count: row.failure_count,
        status,
    })
}

impl JobStore {
    /// The `active` recipe for a (carrier, quote type) pair, if any.
    pub fn find_active_recipe(
        &self,
        carrier_code: &str,
        quote_type: QuoteType,
    ) -> Result<Option<Recipe>, StoreError> {
        let row = self.db.with_conn(|conn| {
            recipe_repo::find_active(conn, carrier_code, quote_type.as_str())
        })?;
        Ok(row.map(recipe_from_row).transpose()?)
    }

    pub fn get_recipe(&self, recipe_id: &str) -> Result<Option<Recipe>, StoreError> {
        let row = self
            .db
            .with_conn(|conn| recipe_repo::find_by_id(conn, recipe_id))?;
        Ok(row.map(recipe_from_row).transpose()?)
    }

    /// Every version of a carrier's recipes, newest first per quote type.
    pub fn list_recipes(&self, carrier_code: &str) -> Result<Vec<Recipe>, StoreError> {
        let rows = self
            .db
            .with_conn(|conn| recipe_repo::list_for_carrier(conn, carrier_code))?;
        Ok(rows
            .into_iter()
            .map(recipe_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Records a new active version for the pair. Older versions are
    /// deprecated rather than edited, so their history stays readable.
    pub fn create_recipe_version(
        &self,
        carrier_code: &str,
        quote_type: QuoteType,
        discovered: &DiscoveredRecipe,
    ) -> Result<Recipe, StoreError> {
        let now = format_timestamp(Utc::now());
        let steps = encode("steps", &discovered.steps)?;
        let field_mappings = encode("field_mappings", &discovered.field_mappings)?;

        let row = self.db.with_tx(|tx| {
            let version = recipe_repo::latest_version(tx, carrier_code, quote_type.as_str())?
                .unwrap_or(0)
                + 1;
            recipe_repo::deprecate_all(tx, carrier_code, quote_type.as_str(), &now)?;

            let row = RecipeRow {
                id: uuid::Uuid::new_v4().to_string(),
                carrier_code: carrier_code.to_string(),
                quote_type: quote_type.as_str().to_string(),
                version,
                steps,
                field_mappings,
                success_count: 0,
                failure_count: 0,
                last_success_at: None,
                last_failure_at: None,
                status: RecipeStatus::Active.as_str().to_string(),
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            recipe_repo::insert(tx, &row)?;
            Ok(row)
        })?;

        log::info!(
            "Recorded recipe v{} for {}/{} ({} steps)",
            row.version,
            carrier_code,
            quote_type,
            discovered.steps.len()
        );
        Ok(recipe_from_row(row)?)
    }

    /// Bumps the success or failure counter and applies the demotion rule.
    /// Returns the recipe's status after the update.
    pub fn record_recipe_outcome(
        &self,
        recipe_id: &str,
        success: bool,
    ) -> Result<Option<RecipeStatus>, StoreError> {
        let now = now_timestamp();
        let rule = self.demotion;

        let row = self.db.with_tx(|tx| {
            let changed = if success {
                recipe_repo::record_success(tx, recipe_id, &now)?
            } else {
                recipe_repo::record_failure(tx, recipe_id, &now)?
            };
            if changed == 0 {
                return Ok(None);
            }

            let Some(row) = recipe_repo::find_by_id(tx, recipe_id)? else {
                return Ok(None);
            };
            let recipe = recipe_from_row(row)?;
            if rule.should_demote(&recipe) {
                recipe_repo::transition_status(
                    tx,
                    recipe_id,
                    RecipeStatus::Active.as_str(),
                    RecipeStatus::NeedsValidation.as_str(),
                    &now,
                )?;
                log::warn!(
                    "Recipe {} for {} demoted to needs_validation (failure rate {:.2} over {} runs)",
                    recipe_id,
                    recipe.carrier_code,
                    recipe.failure_rate(),
                    recipe.total_runs()
                );
                return Ok(Some(RecipeStatus::NeedsValidation));
            }
            Ok(Some(recipe.status))
        })?;

        Ok(row)
    }

    /// Demotes an active recipe to `needs_validation`.
    pub fn flag_needs_validation(&self, recipe_id: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self.db.with_conn(|conn| {
            recipe_repo::transition_status(
                conn,
                recipe_id,
                RecipeStatus::Active.as_str(),
                RecipeStatus::NeedsValidation.as_str(),
                &now,
            )
        })?;
        if changed > 0 {
            log::warn!("Recipe {} flagged needs_validation", recipe_id);
        }
        Ok(changed > 0)
    }

    /// Manually retires a recipe.
    pub fn deprecate_recipe(&self, recipe_id: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self
            .db
            .with_conn(|conn| recipe_repo::deprecate(conn, recipe_id, &now))?;
        Ok(changed > 0)
    }
}
