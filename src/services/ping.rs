//! Ping service and heartbeat failure detection.
//!
//! Tracks per-session liveness with a ring buffer of inter-arrival
//! intervals, an EWMA round-trip time, and a consecutive-failure counter. A
//! background heartbeat loop probes every active session on a jittered
//! interval and feeds a phi-accrual detector: sessions whose suspicion
//! crosses the threshold are reported, sessions that exhaust the failure
//! budget are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::methods;
use crate::session::{Session, SessionId};

/// Tunables for the heartbeat loop and failure detector.
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Base sleep between heartbeat rounds.
    pub interval: Duration,
    /// Fractional jitter applied to the interval (0.2 = +/-20%).
    pub jitter: f64,
    /// Per-ping reply timeout.
    pub timeout: Duration,
    /// Suspicion threshold; above it a session is suspect.
    pub phi_threshold: f64,
    /// Consecutive failures tolerated before a session is down.
    pub failure_budget: u32,
    /// EWMA smoothing factor for round-trip times.
    pub ewma_alpha: f64,
    /// Ring buffer size for inter-arrival intervals.
    pub history: usize,
    /// Concurrent pings per heartbeat round.
    pub max_concurrency: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jitter: 0.2,
            timeout: Duration::from_secs(2),
            phi_threshold: 3.0,
            failure_budget: 3,
            ewma_alpha: 0.2,
            history: 32,
            max_concurrency: 8,
        }
    }
}

/// Classification produced by the failure detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionHealth {
    Healthy,
    Suspect(f64),
    Down,
}

#[derive(Default)]
struct PingState {
    intervals: VecDeque<f64>,
    last_success: Option<Instant>,
    ewma_rtt: Option<f64>,
    consecutive_failures: u32,
}

type SuspectHook = Arc<dyn Fn(&SessionId, f64) + Send + Sync>;
type DownHook = Arc<dyn Fn(&SessionId) + Send + Sync>;

/// Ping service: heartbeat scheduling and phi-accrual suspicion.
pub struct PingService {
    config: PingConfig,
    sessions: Mutex<HashMap<SessionId, (Weak<Session>, PingState)>>,
    on_suspect: Mutex<Option<SuspectHook>>,
    on_down: Mutex<Option<DownHook>>,
}

impl PingService {
    pub fn new(config: PingConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            on_suspect: Mutex::new(None),
            on_down: Mutex::new(None),
        }
    }

    pub async fn set_on_suspect(&self, hook: impl Fn(&SessionId, f64) + Send + Sync + 'static) {
        *self.on_suspect.lock().await = Some(Arc::new(hook));
    }

    pub async fn set_on_down(&self, hook: impl Fn(&SessionId) + Send + Sync + 'static) {
        *self.on_down.lock().await = Some(Arc::new(hook));
    }

    /// Start tracking a session. Idempotent.
    pub async fn register(&self, session: &Arc<Session>) {
        self.sessions
            .lock()
            .await
            .entry(session.id().clone())
            .or_insert_with(|| (Arc::downgrade(session), PingState::default()));
    }

    /// Reset the suspicion clock without sending a ping. Called when
    /// ordinary traffic proves the session alive.
    pub async fn touch(&self, id: &SessionId) {
        if let Some((_, state)) = self.sessions.lock().await.get_mut(id) {
            state.last_success = Some(Instant::now());
        }
    }

    /// Sessions currently tracked by the heartbeat.
    pub async fn active(&self) -> Vec<SessionId> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Send one `ping` and record the outcome.
    pub async fn ping(&self, session: &Arc<Session>) -> bool {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.timeout,
            session.send_request(methods::PING, None),
        )
        .await;
        let succeeded = matches!(outcome, Ok(Ok(_)));
        let now = Instant::now();

        let mut sessions = self.sessions.lock().await;
        let Some((_, state)) = sessions.get_mut(session.id()) else {
            return succeeded;
        };

        if succeeded {
            let rtt = (now - started).as_secs_f64();
            state.ewma_rtt = Some(match state.ewma_rtt {
                Some(prev) => self.config.ewma_alpha * rtt + (1.0 - self.config.ewma_alpha) * prev,
                None => rtt,
            });
            if let Some(last) = state.last_success {
                state.intervals.push_back((now - last).as_secs_f64());
                while state.intervals.len() > self.config.history {
                    state.intervals.pop_front();
                }
            }
            state.last_success = Some(now);
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
        }
        succeeded
    }

    /// Smoothed round-trip time, if any ping has succeeded.
    pub async fn round_trip_time(&self, id: &SessionId) -> Option<Duration> {
        self.sessions
            .lock()
            .await
            .get(id)
            .and_then(|(_, s)| s.ewma_rtt)
            .map(Duration::from_secs_f64)
    }

    pub async fn consecutive_failures(&self, id: &SessionId) -> u32 {
        self.sessions
            .lock()
            .await
            .get(id)
            .map_or(0, |(_, s)| s.consecutive_failures)
    }

    /// Phi-accrual suspicion for a session.
    ///
    /// Inter-arrivals are modeled as exponential with rate `1/mean`, so the
    /// suspicion of a silence of length `t` is `-log10(exp(-t / mean))`.
    pub async fn suspicion(&self, id: &SessionId) -> f64 {
        let sessions = self.sessions.lock().await;
        let Some((_, state)) = sessions.get(id) else {
            return 0.0;
        };
        Self::phi(state)
    }

    fn phi(state: &PingState) -> f64 {
        let Some(last) = state.last_success else {
            return 0.0;
        };
        if state.intervals.is_empty() {
            return 0.0;
        }
        let mean = state.intervals.iter().sum::<f64>() / state.intervals.len() as f64;
        if mean <= 0.0 {
            return f64::INFINITY;
        }
        let elapsed = last.elapsed().as_secs_f64();
        -(-elapsed / mean).exp().log10()
    }

    /// Classify a session against the configured thresholds.
    pub async fn classify(&self, id: &SessionId) -> SessionHealth {
        let sessions = self.sessions.lock().await;
        let Some((_, state)) = sessions.get(id) else {
            return SessionHealth::Down;
        };
        if state.consecutive_failures > self.config.failure_budget {
            return SessionHealth::Down;
        }
        let phi = Self::phi(state);
        if phi > self.config.phi_threshold {
            return SessionHealth::Suspect(phi);
        }
        SessionHealth::Healthy
    }

    pub async fn prune_session(&self, id: &SessionId) {
        self.sessions.lock().await.remove(id);
    }

    /// Launch the background heartbeat loop. It probes every tracked
    /// session each round and stops when `shutdown` is cancelled.
    pub fn start_heartbeat(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self;
        tokio::spawn(async move {
            loop {
                let sleep_for = service.jittered_interval();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                service.clone().heartbeat_round().await;
            }
        })
    }

    fn jittered_interval(&self) -> Duration {
        let base = self.config.interval.as_secs_f64();
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.001))
    }

    async fn heartbeat_round(self: Arc<Self>) {
        let targets: Vec<(SessionId, Weak<Session>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(id, (weak, _))| (id.clone(), weak.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut probes = Vec::with_capacity(targets.len());
        for (id, weak) in targets {
            let service = self.clone();
            let semaphore = semaphore.clone();
            probes.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match weak.upgrade() {
                    Some(session) => {
                        service.ping(&session).await;
                        Some(id)
                    }
                    None => {
                        service.prune_session(&id).await;
                        None
                    }
                }
            }));
        }

        let mut probed: Vec<SessionId> = Vec::new();
        for probe in probes {
            if let Ok(Some(id)) = probe.await {
                probed.push(id);
            }
        }

        for id in probed {
            match self.classify(&id).await {
                SessionHealth::Down => {
                    info!(session = %id, "heartbeat declared session down");
                    if let Some(hook) = self.on_down.lock().await.clone() {
                        hook(&id);
                    }
                    self.prune_session(&id).await;
                }
                SessionHealth::Suspect(phi) => {
                    debug!(session = %id, phi, "heartbeat suspects session");
                    if let Some(hook) = self.on_suspect.lock().await.clone() {
                        hook(&id, phi);
                    }
                }
                SessionHealth::Healthy => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcResponse, Message};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn short_config() -> PingConfig {
        PingConfig {
            interval: Duration::from_millis(10),
            jitter: 0.0,
            timeout: Duration::from_millis(20),
            phi_threshold: 3.0,
            failure_budget: 2,
            ..Default::default()
        }
    }

    /// A session whose ping replies are controlled by a flag.
    fn responsive_session(
        id: &str,
        healthy: Arc<AtomicBool>,
    ) -> (Arc<Session>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Message>(32);
        let session = Session::new(id, tx);
        let responder_session = session.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Message::Request(req) = message {
                    if healthy.load(Ordering::SeqCst) {
                        responder_session
                            .resolve_response(JsonRpcResponse::ok(req.id, json!({})))
                            .await;
                    }
                    // Unhealthy: swallow the request so the ping times out.
                }
            }
        });
        (session, handle)
    }

    #[tokio::test]
    async fn test_ping_success_resets_failures_and_tracks_rtt() {
        let healthy = Arc::new(AtomicBool::new(true));
        let (session, responder) = responsive_session("s", healthy);
        let service = Arc::new(PingService::new(short_config()));
        service.register(&session).await;

        assert!(service.ping(&session).await);
        assert!(service.ping(&session).await);
        assert!(service.round_trip_time(session.id()).await.is_some());
        assert_eq!(service.consecutive_failures(session.id()).await, 0);
        assert_eq!(service.classify(session.id()).await, SessionHealth::Healthy);

        responder.abort();
    }

    #[tokio::test]
    async fn test_ping_failures_accumulate() {
        let healthy = Arc::new(AtomicBool::new(false));
        let (session, responder) = responsive_session("s", healthy);
        let service = Arc::new(PingService::new(short_config()));
        service.register(&session).await;

        for expected in 1..=3 {
            assert!(!service.ping(&session).await);
            assert_eq!(service.consecutive_failures(session.id()).await, expected);
        }
        assert_eq!(service.classify(session.id()).await, SessionHealth::Down);

        responder.abort();
    }

    #[tokio::test]
    async fn test_suspicion_grows_with_silence() {
        let healthy = Arc::new(AtomicBool::new(true));
        let (session, responder) = responsive_session("s", healthy);
        let service = Arc::new(PingService::new(short_config()));
        service.register(&session).await;

        // Two successes establish an interval history.
        service.ping(&session).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        service.ping(&session).await;

        let early = service.suspicion(session.id()).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let late = service.suspicion(session.id()).await;
        assert!(late > early, "suspicion should grow: {early} -> {late}");

        responder.abort();
    }

    #[tokio::test]
    async fn test_touch_resets_suspicion_clock() {
        let healthy = Arc::new(AtomicBool::new(true));
        let (session, responder) = responsive_session("s", healthy);
        let service = Arc::new(PingService::new(short_config()));
        service.register(&session).await;

        service.ping(&session).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        service.ping(&session).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let before = service.suspicion(session.id()).await;
        service.touch(session.id()).await;
        let after = service.suspicion(session.id()).await;
        assert!(after < before);

        responder.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_declares_down_and_prunes() {
        let healthy = Arc::new(AtomicBool::new(true));
        let (session, responder) = responsive_session("s", healthy.clone());
        let service = Arc::new(PingService::new(short_config()));
        service.register(&session).await;

        let downs = Arc::new(AtomicUsize::new(0));
        let down_count = downs.clone();
        service
            .set_on_down(move |_| {
                down_count.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let shutdown = CancellationToken::new();
        let heartbeat = service.clone().start_heartbeat(shutdown.clone());

        // Let a few healthy rounds pass, then stop answering.
        tokio::time::sleep(Duration::from_millis(50)).await;
        healthy.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(2);
        while downs.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert!(service.active().await.is_empty());

        shutdown.cancel();
        heartbeat.await.unwrap();
        responder.abort();
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let healthy = Arc::new(AtomicBool::new(true));
        let (session, responder) = responsive_session("s", healthy);
        let service = Arc::new(PingService::new(short_config()));

        service.register(&session).await;
        service.ping(&session).await;
        service.register(&session).await;
        // Re-registering must not wipe accumulated state.
        assert!(service.round_trip_time(session.id()).await.is_some());

        responder.abort();
    }
}
