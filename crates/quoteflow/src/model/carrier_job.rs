//! Per-carrier execution within a job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::quote::{CaptchaChallenge, QuoteResultData};
use crate::retry::{AttemptRecord, ErrorKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CarrierJobStatus {
    Pending,
    Running,
    CaptchaNeeded,
    Completed,
    Failed,
    Cancelled,
}

impl CarrierJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarrierJobStatus::Pending => "pending",
            CarrierJobStatus::Running => "running",
            CarrierJobStatus::CaptchaNeeded => "captcha_needed",
            CarrierJobStatus::Completed => "completed",
            CarrierJobStatus::Failed => "failed",
            CarrierJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CarrierJobStatus::Pending),
            "running" => Some(CarrierJobStatus::Running),
            "captcha_needed" => Some(CarrierJobStatus::CaptchaNeeded),
            "completed" => Some(CarrierJobStatus::Completed),
            "failed" => Some(CarrierJobStatus::Failed),
            "cancelled" => Some(CarrierJobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CarrierJobStatus::Completed | CarrierJobStatus::Failed | CarrierJobStatus::Cancelled
        )
    }

    /// Forward-only state machine. `Running -> Running` covers re-execution
    /// after redelivery; `CaptchaNeeded -> Running` is the only backward edge.
    pub fn can_transition_to(&self, next: CarrierJobStatus) -> bool {
        use CarrierJobStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Running | CaptchaNeeded | Completed | Failed | Cancelled),
            CaptchaNeeded => matches!(next, Running | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    /// Statuses a row may be in for a move to `self` to be legal.
    pub(crate) fn allowed_predecessors(&self) -> Vec<CarrierJobStatus> {
        [
            CarrierJobStatus::Pending,
            CarrierJobStatus::Running,
            CarrierJobStatus::CaptchaNeeded,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(*self))
        .collect()
    }
}

impl fmt::Display for CarrierJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarrierJob {
    pub id: String,
    pub job_id: String,
    pub carrier_code: String,
    pub status: CarrierJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// 0-100, never decreases.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QuoteResultData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<String>,
    pub used_recipe: bool,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_challenge: Option<CaptchaChallenge>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CarrierJob {
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Terminal state written when a carrier execution settles.
#[derive(Debug, Clone)]
pub enum CarrierOutcome {
    Completed {
        data: QuoteResultData,
        recipe_id: Option<String>,
        attempts: Vec<AttemptRecord>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        recipe_id: Option<String>,
        attempts: Vec<AttemptRecord>,
    },
    Cancelled {
        attempts: Vec<AttemptRecord>,
    },
}

impl CarrierOutcome {
    pub fn status(&self) -> CarrierJobStatus {
        match self {
            CarrierOutcome::Completed { .. } => CarrierJobStatus::Completed,
            CarrierOutcome::Failed { .. } => CarrierJobStatus::Failed,
            CarrierOutcome::Cancelled { .. } => CarrierJobStatus::Cancelled,
        }
    }
}
