//! Recipe repository: versioned procedures keyed by (carrier, quote type).

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw recipe row from the database.
#[derive(Debug, Clone)]
pub struct RecipeRow {
    pub id: String,
    pub carrier_code: String,
    pub quote_type: String,
    pub version: u32,
    /// JSON array of steps.
    pub steps: String,
    /// JSON object mapping client fields to portal fields.
    pub field_mappings: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<String>,
    pub last_failure_at: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl RecipeRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            carrier_code: row.get("carrier_code")?,
            quote_type: row.get("quote_type")?,
            version: row.get("version")?,
            steps: row.get("steps")?,
            field_mappings: row.get("field_mappings")?,
            success_count: row.get("success_count")?,
            failure_count: row.get("failure_count")?,
            last_success_at: row.get("last_success_at")?,
            last_failure_at: row.get("last_failure_at")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new recipe row.
pub fn insert(conn: &Connection, recipe: &RecipeRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO recipes (id, carrier_code, quote_type, version, steps, field_mappings,
         success_count, failure_count, last_success_at, last_failure_at, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            recipe.id,
            recipe.carrier_code,
            recipe.quote_type,
            recipe.version,
            recipe.steps,
            recipe.field_mappings,
            recipe.success_count,
            recipe.failure_count,
            recipe.last_success_at,
            recipe.last_failure_at,
            recipe.status,
            recipe.created_at,
            recipe.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<RecipeRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM recipes WHERE id = ?1",
            params![id],
            RecipeRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds the active recipe for a (carrier, quote type) pair.
pub fn find_active(
    conn: &Connection,
    carrier_code: &str,
    quote_type: &str,
) -> Result<Option<RecipeRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM recipes WHERE carrier_code = ?1 AND quote_type = ?2 AND status = 'active'",
            params![carrier_code, quote_type],
            RecipeRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Highest version recorded for the pair, in any status.
pub fn latest_version(
    conn: &Connection,
    carrier_code: &str,
    quote_type: &str,
) -> Result<Option<u32>, DatabaseError> {
    let version = conn.query_row(
        "SELECT MAX(version) FROM recipes WHERE carrier_code = ?1 AND quote_type = ?2",
        params![carrier_code, quote_type],
        |r| r.get::<_, Option<u32>>(0),
    )?;
    Ok(version)
}

/// Lists every version of a carrier's recipes, newest first.
pub fn list_for_carrier(
    conn: &Connection,
    carrier_code: &str,
) -> Result<Vec<RecipeRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM recipes WHERE carrier_code = ?1 ORDER BY quote_type ASC, version DESC",
    )?;
    let rows = stmt
        .query_map(params![carrier_code], RecipeRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn record_success(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE recipes SET success_count = success_count + 1, last_success_at = ?2, updated_at = ?2
         WHERE id = ?1",
        params![id, now],
    )?;
    Ok(changed)
}

pub fn record_failure(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE recipes SET failure_count = failure_count + 1, last_failure_at = ?2, updated_at = ?2
         WHERE id = ?1",
        params![id, now],
    )?;
    Ok(changed)
}

/// Moves a recipe from `from` to `to`. Returns the number of rows changed.
pub fn transition_status(
    conn: &Connection,
    id: &str,
    from: &str,
    to: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE recipes SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        params![id, from, to, now],
    )?;
    Ok(changed)
}

/// Retires a recipe regardless of its current status.
pub fn deprecate(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE recipes SET status = 'deprecated', updated_at = ?2
         WHERE id = ?1 AND status != 'deprecated'",
        params![id, now],
    )?;
    Ok(changed)
}

/// Deprecates every non-deprecated version of the pair.
pub fn deprecate_all(
    conn: &Connection,
    carrier_code: &str,
    quote_type: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE recipes SET status = 'deprecated', updated_at = ?3
         WHERE carrier_code = ?1 AND quote_type = ?2 AND status != 'deprecated'",
        params![carrier_code, quote_type, now],
    )?;
    Ok(changed)
}
