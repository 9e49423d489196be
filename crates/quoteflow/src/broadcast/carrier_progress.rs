//! Carrier progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::retry::ErrorKind;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Phase of one carrier execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CarrierPhase {
    Started,
    Progress,
    CaptchaNeeded,
    Resumed,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CarrierPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CarrierPhase::Started => write!(f, "Started"),
            CarrierPhase::Progress => write!(f, "In progress"),
            CarrierPhase::CaptchaNeeded => write!(f, "Waiting for CAPTCHA"),
            CarrierPhase::Resumed => write!(f, "Resumed"),
            CarrierPhase::Retrying => write!(f, "Retrying"),
            CarrierPhase::Completed => write!(f, "Completed"),
            CarrierPhase::Failed => write!(f, "Failed"),
            CarrierPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Progress event for one carrier of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarrierProgressEvent {
    pub job_id: String,
    pub carrier_job_id: String,
    pub carrier_code: String,
    pub phase: CarrierPhase,
    /// Human-readable description of the current step.
    pub message: String,
    pub percent: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub premium: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Broadcasts carrier progress events to any number of subscribers.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<CarrierProgressEvent>>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: CarrierProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CarrierProgressEvent> {
        self.sender.subscribe()
    }

    pub fn tracker(
        &self,
        job_id: &str,
        carrier_job_id: &str,
        carrier_code: &str,
    ) -> CarrierProgressTracker {
        CarrierProgressTracker {
            job_id: job_id.to_string(),
            carrier_job_id: carrier_job_id.to_string(),
            carrier_code: carrier_code.to_string(),
            sender: Arc::clone(&self.sender),
        }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// Emits events for a single carrier job.
#[derive(Clone)]
pub struct CarrierProgressTracker {
    job_id: String,
    carrier_job_id: String,
    carrier_code: String,
    sender: Arc<broadcast::Sender<CarrierProgressEvent>>,
}

impl CarrierProgressTracker {
    fn event(&self, phase: CarrierPhase, message: &str, percent: u8) -> CarrierProgressEvent {
        CarrierProgressEvent {
            job_id: self.job_id.clone(),
            carrier_job_id: self.carrier_job_id.clone(),
            carrier_code: self.carrier_code.clone(),
            phase,
            message: message.to_string(),
            percent,
            timestamp: Utc::now(),
            attempt: None,
            screenshot_url: None,
            premium: None,
            error_kind: None,
        }
    }

    fn emit(&self, event: CarrierProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn started(&self, attempt: u32) {
        let mut event = self.event(CarrierPhase::Started, "Execution started", 0);
        event.attempt = Some(attempt);
        self.emit(event);
    }

    pub fn step(&self, message: &str, percent: u8) {
        self.emit(self.event(CarrierPhase::Progress, message, percent));
    }

    pub fn screenshot(&self, url: &str) {
        let mut event = self.event(CarrierPhase::Progress, "Screenshot captured", 0);
        event.screenshot_url = Some(url.to_string());
        self.emit(event);
    }

    pub fn captcha_needed(&self, prompt: &str) {
        self.emit(self.event(CarrierPhase::CaptchaNeeded, prompt, 0));
    }

    pub fn resumed(&self) {
        self.emit(self.event(CarrierPhase::Resumed, "CAPTCHA solved, resuming", 0));
    }

    pub fn retrying(&self, attempt: u32, kind: ErrorKind, message: &str) {
        let mut event = self.event(CarrierPhase::Retrying, message, 0);
        event.attempt = Some(attempt);
        event.error_kind = Some(kind);
        self.emit(event);
    }

    pub fn completed(&self, premium: Option<f64>) {
        let mut event = self.event(CarrierPhase::Completed, "Quote retrieved", 100);
        event.premium = premium;
        self.emit(event);
    }

    pub fn failed(&self, kind: ErrorKind, message: &str) {
        let mut event = self.event(CarrierPhase::Failed, message, 0);
        event.error_kind = Some(kind);
        self.emit(event);
    }

    pub fn cancelled(&self) {
        self.emit(self.event(CarrierPhase::Cancelled, "Execution cancelled", 0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_subscribers() {
        let broadcaster = ProgressBroadcaster::new(10);
        broadcaster.tracker("job-1", "cj-1", "acme").step("login", 20);
    }

    #[test]
    fn test_tracker_events() {
        let broadcaster = ProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();
        let tracker = broadcaster.tracker("job-1", "cj-1", "acme");

        tracker.started(1);
        tracker.step("Filling applicant form", 40);
        tracker.completed(Some(1200.0));

        let started = rx.try_recv().unwrap();
        assert_eq!(started.phase, CarrierPhase::Started);
        assert_eq!(started.attempt, Some(1));

        let step = rx.try_recv().unwrap();
        assert_eq!(step.carrier_code, "acme");
        assert_eq!(step.message, "Filling applicant form");
        assert_eq!(step.percent, 40);

        let done = rx.try_recv().unwrap();
        assert_eq!(done.phase, CarrierPhase::Completed);
        assert_eq!(done.premium, Some(1200.0));
    }

    #[test]
    fn test_failure_carries_kind() {
        let broadcaster = ProgressBroadcaster::default();
        let mut rx = broadcaster.subscribe();

        broadcaster
            .tracker("job-2", "cj-2", "globex")
            .failed(ErrorKind::CredentialsInvalid, "login rejected");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.phase, CarrierPhase::Failed);
        assert_eq!(event.error_kind, Some(ErrorKind::CredentialsInvalid));
        assert_eq!(event.job_id, "job-2");
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let broadcaster = ProgressBroadcaster::default();
        let mut rx = broadcaster.subscribe();
        broadcaster.tracker("job-3", "cj-3", "acme").captcha_needed("Solve the image");

        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["phase"], "captcha_needed");
        assert_eq!(json["carrierJobId"], "cj-3");
        assert!(json.get("premium").is_none());
    }
}
