//! Job store: durable state for jobs, carrier jobs and recipes.
//!
//! The store is the only mutable state shared between execution units.
//! Every transition is a guarded SQL update, so concurrent or redelivered
//! writers observe the persisted state instead of overwriting it.

mod recipes;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::carrier_job_repo::{self, CarrierJobRow, FinishRow};
use crate::db::job_repo::{self, JobRow};
use crate::db::{format_timestamp, now_timestamp, Database, DatabaseError};
use crate::model::{
    aggregate_status, CaptchaChallenge, CarrierJob, CarrierJobStatus, CarrierOutcome,
    DemotionRule, Job, JobError, JobStatus, QuoteResultData, QuoteType,
};
use crate::retry::ErrorKind;

pub use crate::db::job_repo::JobFilter;

/// Errors from job store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_job_status(s: &str, job_id: &str) -> JobStatus {
    JobStatus::parse(s).unwrap_or_else(|| {
        log::warn!(
            "Unknown job status '{}' for job {}, defaulting to Pending",
            s,
            job_id
        );
        JobStatus::Pending
    })
}

fn parse_carrier_status(s: &str, id: &str) -> CarrierJobStatus {
    CarrierJobStatus::parse(s).unwrap_or_else(|| {
        log::warn!(
            "Unknown carrier job status '{}' for {}, defaulting to Pending",
            s,
            id
        );
        CarrierJobStatus::Pending
    })
}

fn parse_quote_type(s: &str, id: &str) -> Result<QuoteType, DatabaseError> {
    QuoteType::parse(s).ok_or_else(|| DatabaseError::CorruptRow {
        table: "jobs",
        reason: format!("unknown quote type '{}' for {}", s, id),
    })
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

fn parse_optional_timestamp(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.map(parse_timestamp)
}

pub(crate) fn decode<T: DeserializeOwned>(
    column: &'static str,
    s: &str,
) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|source| DatabaseError::Json { column, source })
}

fn decode_or_default<T: DeserializeOwned + Default>(
    column: &'static str,
    s: Option<&str>,
) -> Result<T, DatabaseError> {
    match s {
        Some(s) => decode(column, s),
        None => Ok(T::default()),
    }
}

pub(crate) fn encode<T: Serialize>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|source| DatabaseError::Json { column, source })
}

fn job_from_row(row: JobRow) -> Result<Job, DatabaseError> {
    Ok(Job {
        status: parse_job_status(&row.status, &row.id),
        quote_type: parse_quote_type(&row.quote_type, &row.id)?,
        carriers: decode("carriers", &row.carriers)?,
        results: decode_or_default("results", row.results.as_deref())?,
        errors: decode_or_default("errors", row.errors.as_deref())?,
        created_at: parse_timestamp(&row.created_at),
        queued_at: parse_optional_timestamp(row.queued_at.as_deref()),
        started_at: parse_optional_timestamp(row.started_at.as_deref()),
        completed_at: parse_optional_timestamp(row.completed_at.as_deref()),
        id: row.id,
        session_id: row.session_id,
        tenant_id: row.tenant_id,
        priority: row.priority,
        carriers_completed: row.carriers_completed,
        carriers_total: row.carriers_total,
        cancel_requested: row.cancel_requested,
    })
}

fn carrier_job_from_row(row: CarrierJobRow) -> Result<CarrierJob, DatabaseError> {
    let error_kind = row.error_kind.as_deref().map(|k| {
        ErrorKind::parse(k).unwrap_or_else(|| {
            log::warn!("Unknown error kind '{}' for {}, defaulting to UNKNOWN", k, row.id);
            ErrorKind::Unknown
        })
    });

    Ok(CarrierJob {
        status: parse_carrier_status(&row.status, &row.id),
        result: row
            .result
            .as_deref()
            .map(|s| decode("result", s))
            .transpose()?,
        attempts: decode_or_default("attempts", row.attempts.as_deref())?,
        captcha_challenge: row
            .captcha_challenge
            .as_deref()
            .map(|s| decode("captcha_challenge", s))
            .transpose()?,
        created_at: parse_timestamp(&row.created_at),
        started_at: parse_optional_timestamp(row.started_at.as_deref()),
        completed_at: parse_optional_timestamp(row.completed_at.as_deref()),
        error_kind,
        id: row.id,
        job_id: row.job_id,
        carrier_code: row.carrier_code,
        current_step: row.current_step,
        progress: row.progress,
        screenshot_url: row.screenshot_url,
        error_message: row.error_message,
        recipe_id: row.recipe_id,
        used_recipe: row.used_recipe,
    })
}

// ─── Public types ───────────────────────────────────────────────────────────

/// Parameters for creating a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub session_id: String,
    pub tenant_id: String,
    pub quote_type: QuoteType,
    pub carriers: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

/// A job together with its carrier sub-records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub job: Job,
    pub carriers: Vec<CarrierJob>,
}

impl JobStatusReport {
    pub fn carrier(&self, carrier_code: &str) -> Option<&CarrierJob> {
        self.carriers.iter().find(|c| c.carrier_code == carrier_code)
    }
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Durable job, carrier job and recipe records over a shared [`Database`].
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    demotion: DemotionRule,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            demotion: DemotionRule::default(),
        }
    }

    pub fn with_demotion_rule(mut self, rule: DemotionRule) -> Self {
        self.demotion = rule;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Creates a `pending` job and one `pending` carrier job per carrier,
    /// atomically.
    pub fn create_job(&self, new: &NewJob) -> Result<Job, StoreError> {
        if new.carriers.is_empty() {
            return Err(StoreError::InvalidJob("carrier list is empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for carrier in &new.carriers {
            if carrier.trim().is_empty() {
                return Err(StoreError::InvalidJob("carrier code is blank".to_string()));
            }
            if !seen.insert(carrier.as_str()) {
                return Err(StoreError::InvalidJob(format!(
                    "carrier '{}' listed more than once",
                    carrier
                )));
            }
        }

        let now = Utc::now();
        let now_str = format_timestamp(now);
        let job_id = uuid::Uuid::new_v4().to_string();

        let row = JobRow {
            id: job_id.clone(),
            session_id: new.session_id.clone(),
            tenant_id: new.tenant_id.clone(),
            quote_type: new.quote_type.as_str().to_string(),
            carriers: encode("carriers", &new.carriers)?,
            priority: new.priority,
            status: JobStatus::Pending.as_str().to_string(),
            carriers_completed: 0,
            carriers_total: new.carriers.len() as u32,
            results: None,
            errors: None,
            cancel_requested: false,
            created_at: now_str.clone(),
            updated_at: now_str.clone(),
            queued_at: None,
            started_at: None,
            completed_at: None,
        };

        self.db.with_tx(|tx| {
            job_repo::insert(tx, &row)?;
            for carrier in &new.carriers {
                carrier_job_repo::insert(
                    tx,
                    &CarrierJobRow {
                        id: uuid::Uuid::new_v4().to_string(),
                        job_id: job_id.clone(),
                        carrier_code: carrier.clone(),
                        status: CarrierJobStatus::Pending.as_str().to_string(),
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
                        created_at: now_str.clone(),
                        updated_at: now_str.clone(),
                        started_at: None,
                        completed_at: None,
                    },
                )?;
            }
            Ok(())
        })?;

        log::info!(
            "Created job {} for {} carrier(s), priority {}",
            job_id,
            new.carriers.len(),
            new.priority
        );

        Ok(job_from_row(row)?)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let row = self.db.with_conn(|conn| job_repo::find_by_id(conn, job_id))?;
        Ok(row.map(job_from_row).transpose()?)
    }

    /// Loads a job that must exist.
    pub fn require_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.get_job(job_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })
    }

    /// Returns the job record plus its carrier sub-records.
    pub fn get_status(&self, job_id: &str) -> Result<Option<JobStatusReport>, StoreError> {
        let rows = self.db.with_conn(|conn| {
            let Some(job) = job_repo::find_by_id(conn, job_id)? else {
                return Ok(None);
            };
            let carriers = carrier_job_repo::list_by_job(conn, job_id)?;
            Ok(Some((job, carriers)))
        })?;

        let Some((job, carriers)) = rows else {
            return Ok(None);
        };

        Ok(Some(JobStatusReport {
            job: job_from_row(job)?,
            carriers: carriers
                .into_iter()
                .map(carrier_job_from_row)
                .collect::<Result<Vec<_>, _>>()?,
        }))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), StoreError> {
        let (rows, total) = self.db.with_conn(|conn| job_repo::query(conn, filter))?;
        let jobs = rows
            .into_iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    pub fn carrier_jobs(&self, job_id: &str) -> Result<Vec<CarrierJob>, StoreError> {
        let rows = self
            .db
            .with_conn(|conn| carrier_job_repo::list_by_job(conn, job_id))?;
        Ok(rows
            .into_iter()
            .map(carrier_job_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_carrier_job(&self, carrier_job_id: &str) -> Result<Option<CarrierJob>, StoreError> {
        let row = self
            .db
            .with_conn(|conn| carrier_job_repo::find_by_id(conn, carrier_job_id))?;
        Ok(row.map(carrier_job_from_row).transpose()?)
    }

    /// Job IDs currently in `status`, oldest first.
    pub fn job_ids_with_status(&self, status: JobStatus) -> Result<Vec<String>, StoreError> {
        Ok(self
            .db
            .with_conn(|conn| job_repo::ids_with_status(conn, status.as_str()))?)
    }

    // ─── Job transitions ────────────────────────────────────────────────────

    /// `pending -> queued`. Returns false when the job had already moved on.
    pub fn mark_queued(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self
            .db
            .with_conn(|conn| job_repo::mark_queued(conn, job_id, &now))?;
        Ok(changed > 0)
    }

    /// Moves a non-terminal job to `running`.
    pub fn mark_job_running(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self
            .db
            .with_conn(|conn| job_repo::mark_running(conn, job_id, &now))?;
        Ok(changed > 0)
    }

    /// Persists a cancellation request. Returns false if the job is
    /// already terminal or unknown.
    pub fn request_cancel(&self, job_id: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self
            .db
            .with_conn(|conn| job_repo::request_cancel(conn, job_id, &now))?;
        Ok(changed > 0)
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .db
            .with_conn(|conn| job_repo::is_cancel_requested(conn, job_id))?)
    }

    /// Computes and writes the aggregate status once every carrier has
    /// settled. Returns the job's status after the call, or `None` while
    /// carriers are still outstanding.
    pub fn finalize_job(&self, job_id: &str) -> Result<Option<JobStatus>, StoreError> {
        let now = now_timestamp();
        let finalized = self.db.with_tx(|tx| finalize_in(tx, job_id, &now))?;
        match finalized {
            Finalized::Missing => Err(StoreError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            }),
            Finalized::Outstanding => Ok(None),
            Finalized::AlreadyTerminal(status) => Ok(Some(status)),
            Finalized::Written(status) => Ok(Some(status)),
        }
    }

    // ─── Carrier job transitions ────────────────────────────────────────────

    /// Moves a carrier job into `running` for a new attempt. Returns false
    /// if it has already settled.
    pub fn start_carrier_attempt(&self, carrier_job_id: &str) -> Result<bool, StoreError> {
        let from: Vec<&str> = CarrierJobStatus::Running
            .allowed_predecessors()
            .iter()
            .map(|s| s.as_str())
            .collect();
        let now = now_timestamp();
        let changed = self
            .db
            .with_conn(|conn| carrier_job_repo::mark_running(conn, carrier_job_id, &from, &now))?;
        Ok(changed > 0)
    }

    /// Records which recipe (if any) the current attempt runs with.
    pub fn set_carrier_recipe(
        &self,
        carrier_job_id: &str,
        recipe_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self.db.with_conn(|conn| {
            carrier_job_repo::set_recipe(conn, carrier_job_id, recipe_id, &now)
        })?;
        Ok(changed > 0)
    }

    /// Records the current step. Progress only moves forward and is ignored
    /// unless the carrier job is running.
    pub fn update_progress(
        &self,
        carrier_job_id: &str,
        step: &str,
        percent: u8,
    ) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self.db.with_conn(|conn| {
            carrier_job_repo::update_progress(conn, carrier_job_id, step, percent, &now)
        })?;
        Ok(changed > 0)
    }

    pub fn set_screenshot(&self, carrier_job_id: &str, url: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self
            .db
            .with_conn(|conn| carrier_job_repo::set_screenshot(conn, carrier_job_id, url, &now))?;
        Ok(changed > 0)
    }

    /// `running -> captcha_needed`, recording the challenge.
    pub fn park_for_captcha(
        &self,
        carrier_job_id: &str,
        challenge: &CaptchaChallenge,
    ) -> Result<bool, StoreError> {
        let challenge_json = encode("captcha_challenge", challenge)?;
        let now = now_timestamp();
        let changed = self.db.with_conn(|conn| {
            carrier_job_repo::park_for_captcha(conn, carrier_job_id, &challenge_json, &now)
        })?;
        Ok(changed > 0)
    }

    /// Stores a solution for a parked carrier job. Returns false if the
    /// carrier job is not waiting on a CAPTCHA.
    pub fn store_captcha_solution(
        &self,
        carrier_job_id: &str,
        solution: &str,
    ) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self.db.with_conn(|conn| {
            carrier_job_repo::store_captcha_solution(conn, carrier_job_id, solution, &now)
        })?;
        Ok(changed > 0)
    }

    pub fn take_captcha_solution(&self, carrier_job_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .db
            .with_tx(|tx| carrier_job_repo::take_captcha_solution(tx, carrier_job_id))?)
    }

    /// `captcha_needed -> running`.
    pub fn resume_from_captcha(&self, carrier_job_id: &str) -> Result<bool, StoreError> {
        let now = now_timestamp();
        let changed = self.db.with_conn(|conn| {
            carrier_job_repo::mark_running(conn, carrier_job_id, &["captcha_needed"], &now)
        })?;
        Ok(changed > 0)
    }

    /// Writes a carrier job's terminal state and bumps the owning job's
    /// settled counter in one transaction. Returns false if the carrier job
    /// had already settled, in which case nothing changes.
    pub fn finish_carrier_job(
        &self,
        carrier_job_id: &str,
        outcome: &CarrierOutcome,
    ) -> Result<bool, StoreError> {
        let status = outcome.status();
        let finish = match outcome {
            CarrierOutcome::Completed {
                data,
                recipe_id,
                attempts,
            } => FinishRow {
                status: status.as_str(),
                result: Some(encode("result", data)?),
                error_message: None,
                error_kind: None,
                recipe_id: recipe_id.as_deref(),
                used_recipe: recipe_id.is_some(),
                attempts: encode("attempts", attempts)?,
            },
            CarrierOutcome::Failed {
                kind,
                message,
                recipe_id,
                attempts,
            } => FinishRow {
                status: status.as_str(),
                result: None,
                error_message: Some(message.clone()),
                error_kind: Some(kind.as_str()),
                recipe_id: recipe_id.as_deref(),
                used_recipe: recipe_id.is_some(),
                attempts: encode("attempts", attempts)?,
            },
            CarrierOutcome::Cancelled { attempts } => FinishRow {
                status: status.as_str(),
                result: None,
                error_message: Some("cancelled".to_string()),
                error_kind: None,
                recipe_id: None,
                used_recipe: false,
                attempts: encode("attempts", attempts)?,
            },
        };

        let now = now_timestamp();
        let settled = self.db.with_tx(|tx| {
            let Some(row) = carrier_job_repo::find_by_id(tx, carrier_job_id)? else {
                return Ok(false);
            };
            if carrier_job_repo::finish(tx, carrier_job_id, &finish, &now)? == 0 {
                return Ok(false);
            }
            job_repo::increment_settled(tx, &row.job_id, &now)?;
            // The last carrier to settle finalizes the job in the same
            // transaction, so the counter never reads full on a live job.
            finalize_in(tx, &row.job_id, &now)?;
            Ok(true)
        })?;

        if settled {
            log::debug!("Carrier job {} settled as {}", carrier_job_id, status);
        }
        Ok(settled)
    }
}

enum Finalized {
    Missing,
    Outstanding,
    AlreadyTerminal(JobStatus),
    Written(JobStatus),
}

fn finalize_in(conn: &Connection, job_id: &str, now: &str) -> Result<Finalized, DatabaseError> {
    let Some(row) = job_repo::find_by_id(conn, job_id)? else {
        return Ok(Finalized::Missing);
    };
    let job = job_from_row(row)?;
    if job.status.is_terminal() {
        return Ok(Finalized::AlreadyTerminal(job.status));
    }

    let carriers = carrier_job_repo::list_by_job(conn, job_id)?
        .into_iter()
        .map(carrier_job_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    let statuses: Vec<CarrierJobStatus> = carriers.iter().map(|c| c.status).collect();
    let Some(status) = aggregate_status(&statuses, job.cancel_requested) else {
        return Ok(Finalized::Outstanding);
    };

    let mut results: BTreeMap<String, QuoteResultData> = BTreeMap::new();
    let mut errors: Vec<JobError> = Vec::new();
    for carrier in &carriers {
        match carrier.status {
            CarrierJobStatus::Completed => {
                results.insert(
                    carrier.carrier_code.clone(),
                    carrier.result.clone().unwrap_or_default(),
                );
            }
            CarrierJobStatus::Failed => errors.push(JobError {
                carrier_code: carrier.carrier_code.clone(),
                kind: carrier.error_kind.unwrap_or(ErrorKind::Unknown),
                message: carrier.error_message.clone().unwrap_or_default(),
            }),
            _ => {}
        }
    }

    let results_json = encode("results", &results)?;
    let errors_json = encode("errors", &errors)?;
    if job_repo::finalize(conn, job_id, status.as_str(), &results_json, &errors_json, now)? == 0 {
        return Ok(Finalized::AlreadyTerminal(job.status));
    }

    log::info!(
        "Job {} finished {} ({} result(s), {} error(s))",
        job_id,
        status,
        results.len(),
        errors.len()
    );
    Ok(Finalized::Written(status))
}
