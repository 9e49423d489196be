//! Carrier job repository: operations on the `carrier_jobs` table.
//!
//! Every status change is a conditional UPDATE keyed on the set of
//! statuses allowed to precede it, so a stale writer changes zero rows
//! instead of regressing a settled record.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{placeholders, DatabaseError};

/// A raw carrier job row from the database.
#[derive(Debug, Clone)]
pub struct CarrierJobRow {
    pub id: String,
    pub job_id: String,
    pub carrier_code: String,
    pub status: String,
    pub current_step: Option<String>,
    pub progress: u8,
    pub screenshot_url: Option<String>,
    /// JSON-encoded `QuoteResultData`.
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub recipe_id: Option<String>,
    pub used_recipe: bool,
    /// JSON array of attempt records.
    pub attempts: Option<String>,
    /// JSON-encoded `CaptchaChallenge`.
    pub captcha_challenge: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl CarrierJobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            carrier_code: row.get("carrier_code")?,
            status: row.get("status")?,
            current_step: row.get("current_step")?,
            progress: row.get("progress")?,
            screenshot_url: row.get("screenshot_url")?,
            result: row.get("result")?,
            error_message: row.get("error_message")?,
            error_kind: row.get("error_kind")?,
            recipe_id: row.get("recipe_id")?,
            used_recipe: row.get("used_recipe")?,
            attempts: row.get("attempts")?,
            captcha_challenge: row.get("captcha_challenge")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Terminal fields written when a carrier job settles.
#[derive(Debug, Clone)]
pub struct FinishRow<'a> {
    pub status: &'a str,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub error_kind: Option<&'a str>,
    pub recipe_id: Option<&'a str>,
    pub used_recipe: bool,
    pub attempts: String,
}

/// Inserts a new carrier job row.
pub fn insert(conn: &Connection, row: &CarrierJobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO carrier_jobs (id, job_id, carrier_code, status, current_step, progress,
         screenshot_url, result, error_message, error_kind, recipe_id, used_recipe, attempts,
         captcha_challenge, created_at, updated_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            row.id,
            row.job_id,
            row.carrier_code,
            row.status,
            row.current_step,
            row.progress,
            row.screenshot_url,
            row.result,
            row.error_message,
            row.error_kind,
            row.recipe_id,
            row.used_recipe,
            row.attempts,
            row.captcha_challenge,
            row.created_at,
            row.updated_at,
            row.started_at,
            row.completed_at,
        ],
    )?;
    Ok(())
}

/// Finds a carrier job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<CarrierJobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM carrier_jobs WHERE id = ?1",
            params![id],
            CarrierJobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Lists all carrier jobs of a job in creation order.
pub fn list_by_job(conn: &Connection, job_id: &str) -> Result<Vec<CarrierJobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM carrier_jobs WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map(params![job_id], CarrierJobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Moves a carrier job into `running` from one of `from`.
pub fn mark_running(
    conn: &Connection,
    id: &str,
    from: &[&str],
    now: &str,
) -> Result<usize, DatabaseError> {
    let sql = format!(
        "UPDATE carrier_jobs SET status = 'running', started_at = COALESCE(started_at, ?2),
         captcha_challenge = NULL, updated_at = ?2
         WHERE id = ?1 AND status IN ({})",
        placeholders(3, from.len())
    );
    let mut values: Vec<&str> = vec![id, now];
    values.extend_from_slice(from);
    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed)
}

/// Records the recipe an attempt is running with.
pub fn set_recipe(
    conn: &Connection,
    id: &str,
    recipe_id: Option<&str>,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE carrier_jobs SET recipe_id = ?2, used_recipe = (?2 IS NOT NULL), updated_at = ?3
         WHERE id = ?1 AND status = 'running'",
        params![id, recipe_id, now],
    )?;
    Ok(changed)
}

/// Updates the step label and raises progress. Progress never decreases
/// and is frozen outside `running`.
pub fn update_progress(
    conn: &Connection,
    id: &str,
    step: &str,
    progress: u8,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE carrier_jobs SET current_step = ?2, progress = MAX(progress, ?3), updated_at = ?4
         WHERE id = ?1 AND status = 'running'",
        params![id, step, progress.min(100), now],
    )?;
    Ok(changed)
}

pub fn set_screenshot(
    conn: &Connection,
    id: &str,
    url: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE carrier_jobs SET screenshot_url = ?2, updated_at = ?3
         WHERE id = ?1 AND status IN ('running', 'captcha_needed')",
        params![id, url, now],
    )?;
    Ok(changed)
}

/// Parks a running carrier job at `captcha_needed`, clearing any stale
/// solution.
pub fn park_for_captcha(
    conn: &Connection,
    id: &str,
    challenge: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE carrier_jobs SET status = 'captcha_needed', captcha_challenge = ?2,
         captcha_solution = NULL, updated_at = ?3
         WHERE id = ?1 AND status = 'running'",
        params![id, challenge, now],
    )?;
    Ok(changed)
}

/// Stores a human-supplied solution for a parked carrier job.
pub fn store_captcha_solution(
    conn: &Connection,
    id: &str,
    solution: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE carrier_jobs SET captcha_solution = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'captcha_needed'",
        params![id, solution, now],
    )?;
    Ok(changed)
}

/// Reads and clears the stored solution, if any.
pub fn take_captcha_solution(conn: &Connection, id: &str) -> Result<Option<String>, DatabaseError> {
    let solution: Option<String> = conn
        .query_row(
            "SELECT captcha_solution FROM carrier_jobs WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    if solution.is_some() {
        conn.execute(
            "UPDATE carrier_jobs SET captcha_solution = NULL WHERE id = ?1",
            params![id],
        )?;
    }
    Ok(solution)
}

/// Writes the terminal state. Rows that already settled are untouched.
pub fn finish(
    conn: &Connection,
    id: &str,
    finish: &FinishRow<'_>,
    now: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE carrier_jobs SET status = ?2, result = ?3, error_message = ?4, error_kind = ?5,
         recipe_id = COALESCE(?6, recipe_id),
         used_recipe = CASE WHEN ?6 IS NOT NULL THEN ?7 ELSE used_recipe END,
         attempts = ?8, captcha_challenge = NULL, captcha_solution = NULL,
         progress = CASE WHEN ?2 = 'completed' THEN 100 ELSE progress END,
         completed_at = ?9, updated_at = ?9
         WHERE id = ?1 AND status IN ('pending', 'running', 'captcha_needed')",
        params![
            id,
            finish.status,
            finish.result,
            finish.error_message,
            finish.error_kind,
            finish.recipe_id,
            finish.used_recipe,
            finish.attempts,
            now,
        ],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn seed(conn: &Connection) -> Result<(), DatabaseError> {
        conn.execute(
            "INSERT INTO jobs (id, session_id, tenant_id, quote_type, carriers, carriers_total, created_at, updated_at)
             VALUES ('job-1', 's1', 't1', 'auto', '[\"acme\"]', 1, 't0', 't0')",
            [],
        )?;
        insert(
            conn,
            &CarrierJobRow {
                id: "cj-1".to_string(),
                job_id: "job-1".to_string(),
                carrier_code: "acme".to_string(),
                status: "pending".to_string(),
                current_step: None,
                progress: 0,
                screenshot_url: None,
                result: None,
                error_message: None,
                error_kind: None,
                recipe_id: None,
                used_recipe: false,
                attempts: None,
                captcha_challenge: None,
                created_at: "t0".to_string(),
                updated_at: "t0".to_string(),
                started_at: None,
                completed_at: None,
            },
        )
    }

    fn failed(attempts: &str) -> FinishRow<'_> {
        FinishRow {
            status: "failed",
            result: None,
            error_message: Some("portal down".to_string()),
            error_kind: Some("PORTAL_UNAVAILABLE"),
            recipe_id: None,
            used_recipe: false,
            attempts: attempts.to_string(),
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed(conn)?;
            assert_eq!(update_progress(conn, "cj-1", "login", 10, "t")?, 0);
            mark_running(conn, "cj-1", &["pending"], "t1")?;
            update_progress(conn, "cj-1", "login", 30, "t2")?;
            update_progress(conn, "cj-1", "retry login", 20, "t3")?;
            let row = find_by_id(conn, "cj-1")?.unwrap();
            assert_eq!(row.progress, 30);
            assert_eq!(row.current_step.as_deref(), Some("retry login"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_progress_frozen_while_parked() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed(conn)?;
            mark_running(conn, "cj-1", &["pending"], "t1")?;
            update_progress(conn, "cj-1", "quote form", 40, "t2")?;
            assert_eq!(park_for_captcha(conn, "cj-1", "{}", "t3")?, 1);
            assert_eq!(update_progress(conn, "cj-1", "quote form", 60, "t4")?, 0);
            assert_eq!(find_by_id(conn, "cj-1")?.unwrap().progress, 40);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_captcha_solution_slot() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed(conn)?;
            assert_eq!(store_captcha_solution(conn, "cj-1", "abc", "t")?, 0);
            mark_running(conn, "cj-1", &["pending"], "t1")?;
            park_for_captcha(conn, "cj-1", "{\"kind\":\"image\"}", "t2")?;
            assert_eq!(store_captcha_solution(conn, "cj-1", "abc", "t3")?, 1);
            assert_eq!(take_captcha_solution(conn, "cj-1")?.as_deref(), Some("abc"));
            assert_eq!(take_captcha_solution(conn, "cj-1")?, None);

            assert_eq!(mark_running(conn, "cj-1", &["captcha_needed"], "t4")?, 1);
            let row = find_by_id(conn, "cj-1")?.unwrap();
            assert_eq!(row.status, "running");
            assert!(row.captcha_challenge.is_none());
            assert_eq!(row.started_at.as_deref(), Some("t1"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_finish_only_once() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed(conn)?;
            mark_running(conn, "cj-1", &["pending"], "t1")?;
            assert_eq!(finish(conn, "cj-1", &failed("[]"), "t2")?, 1);
            assert_eq!(finish(conn, "cj-1", &failed("[]"), "t3")?, 0);
            assert_eq!(mark_running(conn, "cj-1", &["pending", "captcha_needed"], "t4")?, 0);

            let row = find_by_id(conn, "cj-1")?.unwrap();
            assert_eq!(row.status, "failed");
            assert_eq!(row.error_kind.as_deref(), Some("PORTAL_UNAVAILABLE"));
            assert_eq!(row.completed_at.as_deref(), Some("t2"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_set_recipe_marks_used() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed(conn)?;
            mark_running(conn, "cj-1", &["pending"], "t1")?;
            set_recipe(conn, "cj-1", Some("recipe-1"), "t2")?;
            let row = find_by_id(conn, "cj-1")?.unwrap();
            assert!(row.used_recipe);
            assert_eq!(row.recipe_id.as_deref(), Some("recipe-1"));

            set_recipe(conn, "cj-1", None, "t3")?;
            let row = find_by_id(conn, "cj-1")?.unwrap();
            assert!(!row.used_recipe);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_list_by_job() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            seed(conn)?;
            let rows = list_by_job(conn, "job-1")?;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].carrier_code, "acme");
            assert!(list_by_job(conn, "job-2")?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
