//! Durable, priority-ordered job queue with at-least-once delivery.
//!
//! Redelivery uses a visibility timeout: `dequeue` leases an entry until
//! `now + visibility_timeout`, `ack` deletes it, and a lease that lapses
//! makes the entry visible again. Consumers hold the lease open on long
//! jobs with `extend_visibility`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::db::{now_timestamp, queue_repo, Database, DatabaseError};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// One leased queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub job_id: String,
    /// Identifies this lease; stale after redelivery.
    pub receipt: String,
    pub priority: i32,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Durably admits a job. Enqueueing a job that is already on the queue
    /// is a no-op.
    async fn enqueue(&self, job_id: &str, priority: i32) -> Result<(), QueueError>;

    /// Leases the next job, waiting up to `wait` for one to become visible.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Removes the entry. Returns false if the lease had already lapsed and
    /// been handed to another consumer.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    /// Pushes the lease forward by one visibility timeout.
    async fn extend_visibility(&self, delivery: &Delivery) -> Result<bool, QueueError>;

    fn visibility_timeout(&self) -> Duration;

    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Source of the current time in epoch milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// SQLite-backed queue sharing the job store's database.
pub struct SqliteJobQueue {
    db: Database,
    visibility_timeout: Duration,
    poll_interval: Duration,
    notify: Notify,
    clock: Clock,
}

impl SqliteJobQueue {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            notify: Notify::new(),
            clock: system_clock(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// How often an idle `dequeue` re-checks storage. Entries enqueued by
    /// this process wake waiters immediately; the interval covers other
    /// processes and lapsed leases.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    fn try_claim(&self) -> Result<Option<Delivery>, QueueError> {
        let now = self.now_ms();
        let lease_until = now + self.visibility_timeout.as_millis() as i64;
        let receipt = uuid::Uuid::new_v4().to_string();

        let claimed = self
            .db
            .with_tx(|tx| queue_repo::claim_next(tx, now, lease_until, &receipt))?;

        Ok(claimed.map(|row| Delivery {
            job_id: row.job_id,
            receipt,
            priority: row.priority,
            delivery_count: row.delivery_count,
        }))
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job_id: &str, priority: i32) -> Result<(), QueueError> {
        let now = self.now_ms();
        let enqueued_at = now_timestamp();
        let inserted = self
            .db
            .with_conn(|conn| queue_repo::insert(conn, job_id, priority, &enqueued_at, now))?;

        if inserted > 0 {
            debug!(job_id, priority, "job enqueued");
            self.notify.notify_waiters();
        } else {
            trace!(job_id, "job already on queue");
        }
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking so an enqueue between the
            // check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_claim()? {
                debug!(
                    job_id = %delivery.job_id,
                    delivery_count = delivery.delivery_count,
                    "job dequeued"
                );
                return Ok(Some(delivery));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = self.poll_interval.min(deadline - now);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let removed = self
            .db
            .with_conn(|conn| queue_repo::delete_by_receipt(conn, &delivery.receipt))?;
        if removed == 0 {
            debug!(job_id = %delivery.job_id, "ack for a lapsed lease ignored");
        }
        Ok(removed > 0)
    }

    async fn extend_visibility(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        let until = self.now_ms() + self.visibility_timeout.as_millis() as i64;
        let extended = self
            .db
            .with_conn(|conn| queue_repo::extend_lease(conn, &delivery.receipt, until))?;
        Ok(extended > 0)
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.db.with_conn(queue_repo::depth)?)
    }
}
