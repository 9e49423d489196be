//! Queue repository: leased entries in `queue_entries`.
//!
//! Visibility is tracked in epoch milliseconds so lease comparisons are
//! plain integer arithmetic inside SQLite.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw queue entry.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub seq: i64,
    pub job_id: String,
    pub priority: i32,
    pub enqueued_at: String,
    pub visible_at_ms: i64,
    pub receipt: Option<String>,
    pub delivery_count: u32,
}

impl QueueRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get("seq")?,
            job_id: row.get("job_id")?,
            priority: row.get("priority")?,
            enqueued_at: row.get("enqueued_at")?,
            visible_at_ms: row.get("visible_at_ms")?,
            receipt: row.get("receipt")?,
            delivery_count: row.get("delivery_count")?,
        })
    }
}

/// Admits a job. A job already on the queue keeps its original entry.
pub fn insert(
    conn: &Connection,
    job_id: &str,
    priority: i32,
    enqueued_at: &str,
    visible_at_ms: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO queue_entries (job_id, priority, enqueued_at, visible_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![job_id, priority, enqueued_at, visible_at_ms],
    )?;
    Ok(changed)
}

/// Leases the highest-priority visible entry, FIFO within a priority.
/// Must run inside a transaction so the select and the lease are atomic.
pub fn claim_next(
    conn: &Connection,
    now_ms: i64,
    lease_until_ms: i64,
    receipt: &str,
) -> Result<Option<QueueRow>, DatabaseError> {
    let next = conn
        .query_row(
            "SELECT * FROM queue_entries WHERE visible_at_ms <= ?1
             ORDER BY priority DESC, seq ASC LIMIT 1",
            params![now_ms],
            QueueRow::from_row,
        )
        .optional()?;

    let Some(mut entry) = next else {
        return Ok(None);
    };

    conn.execute(
        "UPDATE queue_entries SET visible_at_ms = ?2, receipt = ?3, delivery_count = delivery_count + 1
         WHERE seq = ?1",
        params![entry.seq, lease_until_ms, receipt],
    )?;

    entry.visible_at_ms = lease_until_ms;
    entry.receipt = Some(receipt.to_string());
    entry.delivery_count += 1;
    Ok(Some(entry))
}

/// Deletes the entry held under `receipt`.
pub fn delete_by_receipt(conn: &Connection, receipt: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM queue_entries WHERE receipt = ?1",
        params![receipt],
    )?;
    Ok(changed)
}

/// Pushes the lease held under `receipt` forward.
pub fn extend_lease(
    conn: &Connection,
    receipt: &str,
    visible_at_ms: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_entries SET visible_at_ms = ?2 WHERE receipt = ?1",
        params![receipt, visible_at_ms],
    )?;
    Ok(changed)
}

pub fn depth(conn: &Connection) -> Result<u64, DatabaseError> {
    let count = conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |r| r.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_priority_then_fifo() {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|tx| {
            insert(tx, "low", 1, "t", 0)?;
            insert(tx, "high-a", 9, "t", 0)?;
            insert(tx, "high-b", 9, "t", 0)?;

            let first = claim_next(tx, 10, 1000, "r1")?.unwrap();
            let second = claim_next(tx, 10, 1000, "r2")?.unwrap();
            let third = claim_next(tx, 10, 1000, "r3")?.unwrap();
            assert_eq!(first.job_id, "high-a");
            assert_eq!(second.job_id, "high-b");
            assert_eq!(third.job_id, "low");
            assert!(claim_next(tx, 10, 1000, "r4")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_lapsed_lease_is_redelivered() {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|tx| {
            insert(tx, "job-1", 0, "t", 0)?;
            let first = claim_next(tx, 0, 100, "r1")?.unwrap();
            assert_eq!(first.delivery_count, 1);
            assert!(claim_next(tx, 50, 150, "r2")?.is_none());

            let again = claim_next(tx, 100, 200, "r2")?.unwrap();
            assert_eq!(again.job_id, "job-1");
            assert_eq!(again.delivery_count, 2);

            // The stale receipt no longer matches.
            assert_eq!(delete_by_receipt(tx, "r1")?, 0);
            assert_eq!(delete_by_receipt(tx, "r2")?, 1);
            assert_eq!(depth(tx)?, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_insert_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            assert_eq!(insert(conn, "job-1", 0, "t", 0)?, 1);
            assert_eq!(insert(conn, "job-1", 5, "t", 0)?, 0);
            assert_eq!(depth(conn)?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_extend_lease() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, "job-1", 0, "t", 0)?;
            claim_next(conn, 0, 100, "r1")?;
            assert_eq!(extend_lease(conn, "r1", 500)?, 1);
            assert!(claim_next(conn, 499, 900, "r2")?.is_none());
            assert!(claim_next(conn, 500, 900, "r2")?.is_some());
            assert_eq!(extend_lease(conn, "unknown", 900)?, 0);
            Ok(())
        })
        .unwrap();
    }
}
