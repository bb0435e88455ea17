//! Sampling capability service (server -> client).
//!
//! Proxies `sampling/createMessage` to the client with three layers of
//! protection: a per-session concurrency semaphore, a per-session circuit
//! breaker over consecutive failures, and a request-scoped timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::methods;
use crate::protocol::types::{CreateMessageParams, CreateMessageResult};
use crate::session::{Session, SessionId};

/// Tunables for the sampling proxy.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Concurrent in-flight requests per session.
    pub concurrency: usize,
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before the half-open probe.
    pub cooldown: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// A half-open probe is in flight; concurrent calls stay rejected until
    /// its outcome lands.
    probing: bool,
}

struct SessionState {
    semaphore: Semaphore,
    breaker: Mutex<Breaker>,
}

/// Sampling service: per-session breaker + semaphore + timeout.
pub struct SamplingService {
    config: SamplingConfig,
    states: Mutex<HashMap<SessionId, Arc<SessionState>>>,
}

impl SamplingService {
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    async fn state_for(&self, id: &SessionId) -> Arc<SessionState> {
        let mut states = self.states.lock().await;
        states
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(SessionState {
                    semaphore: Semaphore::new(self.config.concurrency),
                    breaker: Mutex::new(Breaker {
                        consecutive_failures: 0,
                        opened_at: None,
                        probing: false,
                    }),
                })
            })
            .clone()
    }

    /// Ask the client to run `sampling/createMessage`. Returns the client's
    /// result unchanged.
    pub async fn create_message(
        &self,
        session: &Arc<Session>,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult> {
        if !session.supports_sampling().await {
            return Err(Error::MethodNotFound(
                "Client does not advertise the sampling capability".to_string(),
            ));
        }

        let state = self.state_for(session.id()).await;

        // Breaker gate. The first call after cooldown becomes the single
        // half-open probe; everything else, including calls that arrive
        // while the probe is still in flight, fails fast.
        {
            let mut breaker = state.breaker.lock().await;
            if let Some(opened_at) = breaker.opened_at {
                if breaker.probing || opened_at.elapsed() < self.config.cooldown {
                    return Err(Error::ServiceUnavailable(
                        "sampling circuit breaker is open".to_string(),
                    ));
                }
                debug!(session = %session.id(), "sampling breaker half-open probe");
                breaker.probing = true;
            }
        }

        let _permit = state
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::SessionClosed)?;

        let payload = serde_json::to_value(&params)?;
        let outcome = tokio::time::timeout(
            self.config.timeout,
            session.send_request(methods::SAMPLING_CREATE_MESSAGE, Some(payload)),
        )
        .await;

        let result = match outcome {
            Ok(Ok(value)) => {
                let parsed: CreateMessageResult = serde_json::from_value(value)
                    .map_err(|e| Error::Internal(format!("malformed sampling result: {e}")))?;
                self.record_success(&state).await;
                return Ok(parsed);
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout {
                seconds: self.config.timeout.as_secs(),
            }),
        };

        self.record_failure(session.id(), &state).await;
        result
    }

    async fn record_success(&self, state: &SessionState) {
        let mut breaker = state.breaker.lock().await;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
        breaker.probing = false;
    }

    async fn record_failure(&self, id: &SessionId, state: &SessionState) {
        let mut breaker = state.breaker.lock().await;
        breaker.probing = false;
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.config.failure_threshold {
            if breaker.opened_at.is_none() {
                warn!(
                    session = %id,
                    failures = breaker.consecutive_failures,
                    "sampling circuit breaker opened"
                );
            }
            // A failed probe re-opens the breaker with a fresh cooldown.
            breaker.opened_at = Some(Instant::now());
        }
    }

    pub async fn prune_session(&self, id: &SessionId) {
        self.states.lock().await.remove(id);
    }

    #[cfg(test)]
    pub(crate) async fn consecutive_failures(&self, id: &SessionId) -> u32 {
        self.state_for(id).await.breaker.lock().await.consecutive_failures
    }
}
