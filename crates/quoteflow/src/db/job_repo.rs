//! Job repository: CRUD operations for the `jobs` table.
//!
//! Functions take a `&Connection` so they compose inside a transaction
//! opened with [`Database::with_tx`](super::Database::with_tx).

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{placeholders, DatabaseError};

const TERMINAL: [&str; 4] = ["completed", "failed", "partial", "cancelled"];

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub quote_type: String,
    /// JSON array of carrier codes.
    pub carriers: String,
    pub priority: i32,
    pub status: String,
    pub carriers_completed: u32,
    pub carriers_total: u32,
    /// JSON object keyed by carrier code.
    pub results: Option<String>,
    /// JSON array of `{carrierCode, kind, message}`.
    pub errors: Option<String>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub updated_at: String,
    pub queued_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            tenant_id: row.get("tenant_id")?,
            quote_type: row.get("quote_type")?,
            carriers: row.get("carriers")?,
            priority: row.get("priority")?,
            status: row.get("status")?,
            carriers_completed: row.get("carriers_completed")?,
            carriers_total: row.get("carriers_total")?,
            results: row.get("results")?,
            errors: row.get("errors")?,
            cancel_requested: row.get("cancel_requested")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            queued_at: row.get("queued_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, session_id, tenant_id, quote_type, carriers, priority, status,
         carriers_completed, carriers_total, results, errors, cancel_requested,
         created_at, updated_at, queued_at, started_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            job.id,
            job.session_id,
            job.tenant_id,
            job.quote_type,
            job.carriers,
            job.priority,
            job.status,
            job.carriers_completed,
            job.carriers_total,
            job.results,
            job.errors,
            job.cancel_requested,
            job.created_at,
            job.updated_at,
            job.queued_at,
            job.started_at,
            job.completed_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Moves a `pending` job to `queued`. Returns the number of rows changed.
pub fn mark_queued(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'queued', queued_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id, now],
    )?;
    Ok(changed)
}

/// Moves a non-terminal job to `running`, keeping the first start time.
pub fn mark_running(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?2), updated_at = ?2
         WHERE id = ?1 AND status IN ('pending', 'queued', 'running')",
        params![id, now],
    )?;
    Ok(changed)
}

/// Bumps the settled-carrier counter, never past `carriers_total`.
pub fn increment_settled(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET carriers_completed = carriers_completed + 1, updated_at = ?2
         WHERE id = ?1 AND carriers_completed < carriers_total",
        params![id, now],
    )?;
    Ok(changed)
}

/// Writes the terminal status and aggregated results. A job that is
/// already terminal is left untouched.
pub fn finalize(
    conn: &Connection,
    id: &str,
    status: &str,
    results: &str,
    errors: &str,
    now: &str,
) -> Result<usize, DatabaseError> {
    let sql = format!(
        "UPDATE jobs SET status = ?2, results = ?3, errors = ?4, completed_at = ?5, updated_at = ?5
         WHERE id = ?1 AND status NOT IN ({})",
        placeholders(6, TERMINAL.len())
    );
    let changed = conn.execute(
        &sql,
        params![
            id,
            status,
            results,
            errors,
            now,
            TERMINAL[0],
            TERMINAL[1],
            TERMINAL[2],
            TERMINAL[3],
        ],
    )?;
    Ok(changed)
}

/// Flags a non-terminal job for cooperative cancellation.
pub fn request_cancel(conn: &Connection, id: &str, now: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET cancel_requested = 1, updated_at = ?2
         WHERE id = ?1 AND status IN ('pending', 'queued', 'running')",
        params![id, now],
    )?;
    Ok(changed)
}

/// Returns whether cancellation was requested for the job.
pub fn is_cancel_requested(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let flag = conn
        .query_row(
            "SELECT cancel_requested FROM jobs WHERE id = ?1",
            params![id],
            |r| r.get::<_, bool>(0),
        )
        .optional()?;
    Ok(flag.unwrap_or(false))
}

/// Lists job IDs in the given status, oldest first.
pub fn ids_with_status(conn: &Connection, status: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at ASC")?;
    let ids = stmt
        .query_map(params![status], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref tenant_id) = filter.tenant_id {
        conditions.push(format!("tenant_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(tenant_id.clone()));
    }
    if let Some(ref status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn make_job(id: &str, carriers: &[&str]) -> JobRow {
        JobRow {
            id: id.to_string(),
            session_id: "session-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            quote_type: "auto".to_string(),
            carriers: serde_json::to_string(carriers).unwrap(),
            priority: 0,
            status: "pending".to_string(),
            carriers_completed: 0,
            carriers_total: carriers.len() as u32,
            results: None,
            errors: None,
            cancel_requested: false,
            created_at: "2026-01-15T10:00:00+00:00".to_string(),
            updated_at: "2026-01-15T10:00:00+00:00".to_string(),
            queued_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &make_job("job-1", &["acme", "globex"]))?;
            let found = find_by_id(conn, "job-1")?.unwrap();
            assert_eq!(found.carriers_total, 2);
            assert_eq!(found.status, "pending");
            assert!(!found.cancel_requested);
            assert!(find_by_id(conn, "missing")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_status_transitions_are_guarded() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &make_job("job-1", &["acme"]))?;
            assert_eq!(mark_queued(conn, "job-1", "t1")?, 1);
            assert_eq!(mark_queued(conn, "job-1", "t2")?, 0);
            assert_eq!(mark_running(conn, "job-1", "t3")?, 1);
            assert_eq!(finalize(conn, "job-1", "completed", "{}", "[]", "t4")?, 1);
            assert_eq!(finalize(conn, "job-1", "failed", "{}", "[]", "t5")?, 0);
            assert_eq!(mark_running(conn, "job-1", "t6")?, 0);
            assert_eq!(request_cancel(conn, "job-1", "t7")?, 0);

            let job = find_by_id(conn, "job-1")?.unwrap();
            assert_eq!(job.status, "completed");
            assert_eq!(job.started_at.as_deref(), Some("t3"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_settled_counter_capped_at_total() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &make_job("job-1", &["acme", "globex"]))?;
            assert_eq!(increment_settled(conn, "job-1", "t")?, 1);
            assert_eq!(increment_settled(conn, "job-1", "t")?, 1);
            assert_eq!(increment_settled(conn, "job-1", "t")?, 0);
            let job = find_by_id(conn, "job-1")?.unwrap();
            assert_eq!(job.carriers_completed, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_cancel_flag() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &make_job("job-1", &["acme"]))?;
            assert!(!is_cancel_requested(conn, "job-1")?);
            assert_eq!(request_cancel(conn, "job-1", "t")?, 1);
            assert!(is_cancel_requested(conn, "job-1")?);
            assert!(!is_cancel_requested(conn, "missing")?);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_query_filters_by_tenant_and_status() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &make_job("job-1", &["acme"]))?;
            let mut other = make_job("job-2", &["acme"]);
            other.tenant_id = "tenant-2".to_string();
            insert(conn, &other)?;
            insert(conn, &make_job("job-3", &["acme"]))?;
            mark_queued(conn, "job-3", "t")?;

            let filter = JobFilter {
                tenant_id: Some("tenant-1".to_string()),
                ..Default::default()
            };
            let (rows, total) = query(conn, &filter)?;
            assert_eq!(total, 2);
            assert_eq!(rows.len(), 2);

            let filter = JobFilter {
                status: Some("pending".to_string()),
                ..Default::default()
            };
            let (_, total) = query(conn, &filter)?;
            assert_eq!(total, 2);

            assert_eq!(ids_with_status(conn, "queued")?, vec!["job-3".to_string()]);
            Ok(())
        })
        .unwrap();
    }
}
