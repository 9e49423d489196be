//! Browser session manager.
//!
//! Hands out isolated remote browser sessions, at most `max_sessions` at a
//! time. A [`SessionLease`] owns both the remote session and its slot; it
//! must be released with [`SessionLease::release`], and a lease dropped
//! without release (panic, aborted task) tears the session down in the
//! background so the slot is never lost.

pub mod provider;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub use provider::HttpBrowserSessionProvider;

pub const DEFAULT_MAX_SESSIONS: usize = 8;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("No browser session available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("Browser session provider error: {0}")]
    Provider(String),

    #[error("Browser session pool is closed")]
    Closed,
}

/// A remote browser session ready for one carrier execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSession {
    pub id: String,
    /// CDP/WebSocket endpoint, when the provider exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_url: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Creates and destroys remote browser sessions.
#[async_trait]
pub trait BrowserSessionProvider: Send + Sync {
    async fn create_session(&self) -> Result<BrowserSession, SessionError>;
    async fn destroy_session(&self, session_id: &str) -> Result<(), SessionError>;
}

/// Acquire/release counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl SessionStats {
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

#[derive(Clone)]
pub struct BrowserSessionManager {
    provider: Arc<dyn BrowserSessionProvider>,
    slots: Arc<Semaphore>,
    acquire_timeout: Duration,
    stats: Arc<SessionStats>,
}

impl BrowserSessionManager {
    pub fn new(provider: Arc<dyn BrowserSessionProvider>, max_sessions: usize) -> Self {
        Self {
            provider,
            slots: Arc::new(Semaphore::new(max_sessions.max(1))),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Acquires a session with the configured timeout.
    pub async fn acquire(&self) -> Result<SessionLease, SessionError> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Waits at most `timeout` for a free slot, then creates the session.
    /// The create call is bounded by the provider's own request timeout and
    /// runs on its own task: if the caller stops waiting, a session that
    /// still comes up is destroyed instead of leaking.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<SessionLease, SessionError> {
        let permit = tokio::time::timeout(timeout, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| SessionError::AcquireTimeout(timeout))?
            .map_err(|_| SessionError::Closed)?;

        let (tx, rx) = oneshot::channel();
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let created = provider.create_session().await;
            if let Err(Ok(orphan)) = tx.send(created.map(|session| (permit, session))) {
                let (permit, session) = orphan;
                warn!(session_id = %session.id, "session acquire abandoned, destroying");
                if let Err(e) = provider.destroy_session(&session.id).await {
                    warn!(session_id = %session.id, "failed to destroy browser session: {}", e);
                }
                drop(permit);
            }
        });

        let (permit, session) = rx
            .await
            .map_err(|_| SessionError::Provider("session create task aborted".to_string()))??;

        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %session.id, "browser session acquired");

        Ok(SessionLease {
            session,
            permit: Some(permit),
            provider: self.provider.clone(),
            stats: self.stats.clone(),
        })
    }

    /// Returns a lease. Equivalent to [`SessionLease::release`].
    pub async fn release(&self, lease: SessionLease) {
        lease.release().await;
    }

    /// Stops handing out sessions; pending acquires fail with `Closed`.
    pub fn close(&self) {
        self.slots.close();
    }
}

/// Exclusive ownership of one browser session and its pool slot.
pub struct SessionLease {
    session: BrowserSession,
    permit: Option<OwnedSemaphorePermit>,
    provider: Arc<dyn BrowserSessionProvider>,
    stats: Arc<SessionStats>,
}

impl SessionLease {
    pub fn session(&self) -> &BrowserSession {
        &self.session
    }

    /// Tears the remote session down and frees the slot. Provider errors
    /// are logged; the slot is returned regardless.
    pub async fn release(mut self) {
        if let Err(e) = self.provider.destroy_session(&self.session.id).await {
            warn!(session_id = %self.session.id, "failed to destroy browser session: {}", e);
        }
        self.finish();
        debug!(session_id = %self.session.id, "browser session released");
    }

    fn finish(&mut self) {
        if self.permit.take().is_some() {
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.permit.is_none() {
            return;
        }
        warn!(session_id = %self.session.id, "browser session dropped without release");
        self.finish();

        let provider = self.provider.clone();
        let session_id = self.session.id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = provider.destroy_session(&session_id).await {
                    warn!(session_id = %session_id, "background teardown failed: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProvider {
        created: AtomicU64,
        destroyed: Mutex<Vec<String>>,
        fail_create: bool,
        create_delay: Duration,
    }

    #[async_trait]
    impl BrowserSessionProvider for FakeProvider {
        async fn create_session(&self) -> Result<BrowserSession, SessionError> {
            if self.fail_create {
                return Err(SessionError::Provider("503 Service Unavailable".to_string()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.create_delay).await;
            Ok(BrowserSession {
                id: format!("session-{}", n),
                connect_url: None,
                created_at: Utc::now(),
            })
        }

        async fn destroy_session(&self, session_id: &str) -> Result<(), SessionError> {
            self.destroyed.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release_balance() {
        let provider = Arc::new(FakeProvider::default());
        let manager = BrowserSessionManager::new(provider.clone(), 2);

        let lease = manager.acquire().await.unwrap();
        assert_eq!(manager.available_slots(), 1);
        assert_eq!(manager.stats().outstanding(), 1);

        manager.release(lease).await;
        assert_eq!(manager.available_slots(), 2);
        assert_eq!(manager.stats().acquired(), 1);
        assert_eq!(manager.stats().released(), 1);
        assert_eq!(provider.destroyed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_fails_fast_when_exhausted() {
        let manager = BrowserSessionManager::new(Arc::new(FakeProvider::default()), 1)
            .with_acquire_timeout(Duration::from_secs(5));
        let _held = manager.acquire().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = manager.acquire().await.err().unwrap();
        assert!(matches!(err, SessionError::AcquireTimeout(_)));
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(manager.stats().acquired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_create_is_not_cut_by_acquire_timeout() {
        let provider = Arc::new(FakeProvider {
            create_delay: Duration::from_secs(6),
            ..Default::default()
        });
        let manager = BrowserSessionManager::new(provider.clone(), 1)
            .with_acquire_timeout(Duration::from_secs(5));

        let lease = manager.acquire().await.unwrap();
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
        lease.release().await;
        assert_eq!(provider.destroyed.lock().unwrap().len(), 1);
        assert_eq!(manager.stats().outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquire_destroys_late_session() {
        let provider = Arc::new(FakeProvider {
            create_delay: Duration::from_secs(6),
            ..Default::default()
        });
        let manager = BrowserSessionManager::new(provider.clone(), 1);

        let abandoned = tokio::time::timeout(Duration::from_secs(1), manager.acquire()).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
        assert_eq!(provider.destroyed.lock().unwrap().len(), 1);
        assert_eq!(manager.available_slots(), 1);
        assert_eq!(manager.stats().acquired(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_returns_slot() {
        let provider = Arc::new(FakeProvider {
            fail_create: true,
            ..Default::default()
        });
        let manager = BrowserSessionManager::new(provider, 1);
        assert!(matches!(
            manager.acquire().await,
            Err(SessionError::Provider(_))
        ));
        assert_eq!(manager.available_slots(), 1);
        assert_eq!(manager.stats().acquired(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_torn_down() {
        let provider = Arc::new(FakeProvider::default());
        let manager = BrowserSessionManager::new(provider.clone(), 1);

        let lease = manager.acquire().await.unwrap();
        drop(lease);
        assert_eq!(manager.available_slots(), 1);
        assert_eq!(manager.stats().outstanding(), 0);

        for _ in 0..10 {
            if !provider.destroyed.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.destroyed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_not_shared() {
        let manager = BrowserSessionManager::new(Arc::new(FakeProvider::default()), 2);
        let a = manager.acquire().await.unwrap();
        let b = manager.acquire().await.unwrap();
        assert_ne!(a.session().id, b.session().id);
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let manager = BrowserSessionManager::new(Arc::new(FakeProvider::default()), 1);
        manager.close();
        assert!(matches!(manager.acquire().await, Err(SessionError::Closed)));
    }
}
