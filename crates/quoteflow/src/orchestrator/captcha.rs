//! Parks carrier jobs on a CAPTCHA and hands them the human's answer.
//!
//! The solution travels through the carrier job row, so it reaches the
//! waiting unit whichever process accepted it. Local submissions also wake
//! the waiter directly instead of waiting for the next poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::CaptchaChallenge;
use crate::retry::QuoteError;
use crate::store::{JobStore, StoreError};

pub const DEFAULT_SOLUTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct CaptchaBroker {
    store: JobStore,
    waiters: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    poll_interval: Duration,
}

fn store_failure(e: StoreError) -> QuoteError {
    QuoteError::unknown(format!("job store error while handling CAPTCHA: {}", e))
}

/// Drops the waiter registration on every exit path.
struct WaiterGuard<'a> {
    broker: &'a CaptchaBroker,
    carrier_job_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut waiters) = self.broker.waiters.lock() {
            waiters.remove(self.carrier_job_id);
        }
    }
}

impl CaptchaBroker {
    pub fn new(store: JobStore) -> Self {
        Self {
            store,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: DEFAULT_SOLUTION_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn register(&self, carrier_job_id: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(carrier_job_id.to_string(), notify.clone());
        }
        notify
    }

    /// Moves the carrier job to `captcha_needed` and blocks until a
    /// solution arrives or `cancel` fires. There is no deadline of its own.
    /// On success the carrier job is back in `running`.
    pub async fn await_solution(
        &self,
        carrier_job_id: &str,
        challenge: &CaptchaChallenge,
        cancel: &CancellationToken,
    ) -> Result<String, QuoteError> {
        let notify = self.register(carrier_job_id);
        let _guard = WaiterGuard {
            broker: self,
            carrier_job_id,
        };

        if !self
            .store
            .park_for_captcha(carrier_job_id, challenge)
            .map_err(store_failure)?
        {
            return Err(QuoteError::captcha_failed(
                "carrier job is not running, cannot wait for a CAPTCHA",
            ));
        }
        info!(carrier_job_id, kind = %challenge.kind, "Waiting for CAPTCHA solution");

        loop {
            if let Some(solution) = self
                .store
                .take_captcha_solution(carrier_job_id)
                .map_err(store_failure)?
            {
                if !self
                    .store
                    .resume_from_captcha(carrier_job_id)
                    .map_err(store_failure)?
                {
                    return Err(QuoteError::unknown(
                        "carrier job settled while waiting for a CAPTCHA",
                    ));
                }
                debug!(carrier_job_id, "CAPTCHA solution received");
                return Ok(solution);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(QuoteError::unknown("cancelled while waiting for a CAPTCHA"));
                }
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Persists a solution and wakes a local waiter. Returns false when the
    /// carrier job is not parked on a CAPTCHA.
    pub fn submit_solution(&self, carrier_job_id: &str, solution: &str) -> Result<bool, StoreError> {
        if !self.store.store_captcha_solution(carrier_job_id, solution)? {
            return Ok(false);
        }
        if let Ok(waiters) = self.waiters.lock() {
            if let Some(notify) = waiters.get(carrier_job_id) {
                notify.notify_one();
            }
        }
        Ok(true)
    }
}
