//! Scripted stand-ins for the engine's external seams.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;

use quoteflow::agent::{AgentFactory, QuoteAgent, QuoteParams};
use quoteflow::collab::{ClientDataProvider, CollaboratorError, CredentialStore};
use quoteflow::model::{
    CaptchaChallenge, CarrierCredentials, ClientData, DiscoveredRecipe, QuoteResult,
    QuoteResultData, Recipe,
};
use quoteflow::retry::{ErrorKind, QuoteError};
use quoteflow::session::{BrowserSession, BrowserSessionProvider, SessionError};

use super::builders::sample_client_data;

pub const DEFAULT_PREMIUM: f64 = 1200.0;

/// What one agent execution does.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { premium: f64 },
    Discover { premium: f64, recipe: DiscoveredRecipe },
    Fail(ErrorKind),
    /// Hands a CAPTCHA to the engine, then succeeds with the answer.
    Captcha { premium: f64 },
    /// Takes `delay` before succeeding.
    Slow { delay: Duration, premium: f64 },
    /// Runs until cancelled.
    Hang,
    Panic,
}

/// One recorded agent execution.
#[derive(Debug, Clone)]
pub struct Call {
    pub job_id: String,
    pub carrier_code: String,
    pub used_recipe: bool,
    pub captcha_solution: Option<String>,
}

#[derive(Default)]
struct Script {
    behaviors: Mutex<HashMap<String, VecDeque<Behavior>>>,
    calls: Mutex<Vec<Call>>,
    solutions: Mutex<Vec<String>>,
    cancels: AtomicUsize,
}

/// Agent factory whose agents follow a per-carrier script. Carriers with
/// nothing scripted succeed with [`DEFAULT_PREMIUM`].
#[derive(Default)]
pub struct ScriptedAgents {
    script: Arc<Script>,
}

impl ScriptedAgents {
    pub fn script(&self, carrier_code: &str, behaviors: Vec<Behavior>) {
        self.script
            .behaviors
            .lock()
            .unwrap()
            .entry(carrier_code.to_string())
            .or_default()
            .extend(behaviors);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, carrier_code: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.carrier_code == carrier_code)
            .count()
    }

    /// CAPTCHA answers agents received back from the engine.
    pub fn solutions(&self) -> Vec<String> {
        self.script.solutions.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> usize {
        self.script.cancels.load(Ordering::SeqCst)
    }
}

impl AgentFactory for ScriptedAgents {
    fn create_agent(&self, _carrier_code: &str, _recipe: Option<&Recipe>) -> Arc<dyn QuoteAgent> {
        Arc::new(ScriptedAgent {
            script: self.script.clone(),
        })
    }
}

struct ScriptedAgent {
    script: Arc<Script>,
}

fn quote(premium: f64) -> QuoteResultData {
    QuoteResultData {
        premium: Some(premium),
        premium_monthly: Some((premium / 12.0 * 100.0).round() / 100.0),
        extracted_at: Some(Utc::now()),
        ..Default::default()
    }
}

#[async_trait]
impl QuoteAgent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute_quote(&self, params: &QuoteParams) -> QuoteResult {
        let behavior = self
            .script
            .behaviors
            .lock()
            .unwrap()
            .get_mut(&params.carrier_code)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Behavior::Succeed {
                premium: DEFAULT_PREMIUM,
            });
        self.script.calls.lock().unwrap().push(Call {
            job_id: params.job_id.clone(),
            carrier_code: params.carrier_code.clone(),
            used_recipe: params.uses_recipe(),
            captcha_solution: params.captcha_solution.clone(),
        });

        params.progress.report("Logging in", 20);
        match behavior {
            Behavior::Succeed { premium } => {
                params.progress.report("Reading quote", 80);
                QuoteResult::success(quote(premium))
            }
            Behavior::Discover { premium, recipe } => {
                QuoteResult::success(quote(premium)).with_discovered(Some(recipe))
            }
            Behavior::Fail(kind) => QuoteResult::failure(QuoteError::new(
                kind,
                format!("scripted {} failure", kind),
            )),
            Behavior::Captcha { premium } => {
                params.progress.report("Solving CAPTCHA", 30);
                let challenge = CaptchaChallenge {
                    kind: "image".to_string(),
                    prompt: Some("Type the characters shown".to_string()),
                    ..Default::default()
                };
                match params.captcha.request_solution(challenge).await {
                    Ok(solution) => {
                        self.script.solutions.lock().unwrap().push(solution);
                        params.progress.report("Reading quote", 80);
                        QuoteResult::success(quote(premium))
                    }
                    Err(e) => QuoteResult::failure(e),
                }
            }
            Behavior::Slow { delay, premium } => {
                tokio::time::sleep(delay).await;
                QuoteResult::success(quote(premium))
            }
            Behavior::Hang => {
                params.cancel.cancelled().await;
                QuoteResult::failure(QuoteError::unknown("stopped"))
            }
            Behavior::Panic => panic!("scripted agent panic"),
        }
    }

    async fn cancel(&self) {
        self.script.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Session provider handing out numbered sessions.
#[derive(Default)]
pub struct FakeSessions {
    next_id: AtomicU32,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
}

#[async_trait]
impl BrowserSessionProvider for FakeSessions {
    async fn create_session(&self) -> Result<BrowserSession, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(BrowserSession {
            id: format!("session-{}", id),
            connect_url: None,
            created_at: Utc::now(),
        })
    }

    async fn destroy_session(&self, _session_id: &str) -> Result<(), SessionError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Client data keyed by session id. The default session is always present.
pub struct FakeClientData {
    sessions: Mutex<HashMap<String, ClientData>>,
    /// Transient failures to return before answering.
    failures: AtomicU32,
}

impl Default for FakeClientData {
    fn default() -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(super::builders::SESSION.to_string(), sample_client_data());
        Self {
            sessions: Mutex::new(sessions),
            failures: AtomicU32::new(0),
        }
    }
}

impl FakeClientData {
    pub fn fail_next(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientDataProvider for FakeClientData {
    async fn fetch_client_data(
        &self,
        _tenant_id: &str,
        session_id: &str,
    ) -> Result<ClientData, CollaboratorError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CollaboratorError::Transport("connection reset".to_string()));
        }
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound {
                what: "client data session",
                id: session_id.to_string(),
            })
    }
}

/// Grants credentials for every carrier except the ones marked missing.
#[derive(Default)]
pub struct FakeCredentials {
    missing: Mutex<HashSet<String>>,
}

impl FakeCredentials {
    pub fn remove(&self, carrier_code: &str) {
        self.missing
            .lock()
            .unwrap()
            .insert(carrier_code.to_string());
    }
}

#[async_trait]
impl CredentialStore for FakeCredentials {
    async fn get_credentials(
        &self,
        _tenant_id: &str,
        carrier_code: &str,
    ) -> Result<CarrierCredentials, CollaboratorError> {
        if self.missing.lock().unwrap().contains(carrier_code) {
            return Err(CollaboratorError::NotFound {
                what: "credentials",
                id: carrier_code.to_string(),
            });
        }
        Ok(CarrierCredentials {
            username: format!("agent@{}", carrier_code),
            password: SecretString::from("hunter2".to_string()),
            mfa_code: None,
        })
    }
}
