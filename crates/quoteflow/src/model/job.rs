//! Job entity: one quote request against a set of carriers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::carrier_job::CarrierJobStatus;
use super::quote::QuoteResultData;
use crate::retry::ErrorKind;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "partial" => Some(JobStatus::Partial),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Partial | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line of business being quoted. Recipes are keyed by carrier and quote type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuoteType {
    Home,
    Auto,
    Bundle,
}

impl QuoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteType::Home => "home",
            QuoteType::Auto => "auto",
            QuoteType::Bundle => "bundle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "home" => Some(QuoteType::Home),
            "auto" => Some(QuoteType::Auto),
            "bundle" => Some(QuoteType::Bundle),
            _ => None,
        }
    }
}

impl fmt::Display for QuoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-carrier failure surfaced on the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub carrier_code: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Client-data session this job quotes.
    pub session_id: String,
    pub tenant_id: String,
    pub quote_type: QuoteType,
    pub carriers: Vec<String>,
    /// Higher is dequeued first.
    pub priority: i32,
    pub status: JobStatus,
    /// Carriers that reached a terminal status.
    pub carriers_completed: u32,
    pub carriers_total: u32,
    /// Successful quotes keyed by carrier code.
    #[serde(default)]
    pub results: BTreeMap<String, QuoteResultData>,
    #[serde(default)]
    pub errors: Vec<JobError>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Computes a job's terminal status from its settled carrier statuses.
///
/// Returns `None` while any carrier is still unsettled.
pub fn aggregate_status(
    carriers: &[CarrierJobStatus],
    cancel_requested: bool,
) -> Option<JobStatus> {
    if carriers.iter().any(|s| !s.is_terminal()) {
        return None;
    }
    if cancel_requested {
        return Some(JobStatus::Cancelled);
    }

    let succeeded = carriers
        .iter()
        .filter(|s| **s == CarrierJobStatus::Completed)
        .count();

    Some(if succeeded == carriers.len() {
        JobStatus::Completed
    } else if succeeded == 0 {
        JobStatus::Failed
    } else {
        JobStatus::Partial
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Partial,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::parse("superseded").is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Partial.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_aggregate_all_completed() {
        let statuses = [CarrierJobStatus::Completed, CarrierJobStatus::Completed];
        assert_eq!(aggregate_status(&statuses, false), Some(JobStatus::Completed));
    }

    #[test]
    fn test_aggregate_all_failed() {
        let statuses = [CarrierJobStatus::Failed, CarrierJobStatus::Cancelled];
        assert_eq!(aggregate_status(&statuses, false), Some(JobStatus::Failed));
    }

    #[test]
    fn test_aggregate_mixed_is_partial() {
        let statuses = [
            CarrierJobStatus::Completed,
            CarrierJobStatus::Completed,
            CarrierJobStatus::Failed,
        ];
        assert_eq!(aggregate_status(&statuses, false), Some(JobStatus::Partial));
    }

    #[test]
    fn test_aggregate_waits_for_last_carrier() {
        let statuses = [CarrierJobStatus::Completed, CarrierJobStatus::CaptchaNeeded];
        assert_eq!(aggregate_status(&statuses, false), None);
    }

    #[test]
    fn test_aggregate_cancelled_job() {
        let statuses = [CarrierJobStatus::Completed, CarrierJobStatus::Cancelled];
        assert_eq!(aggregate_status(&statuses, true), Some(JobStatus::Cancelled));
    }

    #[test]
    fn test_quote_type_parse() {
        assert_eq!(QuoteType::parse("auto"), Some(QuoteType::Auto));
        assert_eq!(QuoteType::parse("boat"), None);
    }
}
