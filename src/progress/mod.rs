//! Progress tracking for long-running operations.
//!
//! A [`ProgressTracker`] is keyed by the progress token the requester put in
//! its request metadata. It enforces strictly increasing progress, coalesces
//! bursts down to the configured emission rate, retries transient send
//! failures with jittered backoff, and guarantees the final value is flushed
//! when the tracker closes.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::methods;
use crate::protocol::types::{ProgressParams, ProgressToken};
use crate::session::Session;

/// Emission coalescing rate: at most one send per tick.
const DEFAULT_RATE_HZ: f64 = 8.0;
/// Jittered backoff band for transient send failures.
const DEFAULT_RETRY_BAND: Range<u64> = 50..250;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Telemetry hooks fired by the tracker. All methods default to no-ops.
pub trait ProgressEvents: Send + Sync {
    fn on_start(&self, _token: &ProgressToken) {}
    fn on_emit(&self, _token: &ProgressToken, _progress: f64) {}
    fn on_close(&self, _token: &ProgressToken, _last: Option<f64>) {}
}

struct NoEvents;
impl ProgressEvents for NoEvents {}

struct TrackerState {
    last_reported: Option<f64>,
    pending: Option<(f64, Option<String>)>,
    last_emit: Option<Instant>,
    closed: bool,
}

/// Monotonic, coalesced progress emitter bound to one session and token.
pub struct ProgressTracker {
    session: Arc<Session>,
    token: ProgressToken,
    total: Option<f64>,
    min_interval: Duration,
    retry_band_ms: Range<u64>,
    max_retries: u32,
    events: Arc<dyn ProgressEvents>,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(session: Arc<Session>, token: ProgressToken, total: Option<f64>) -> Self {
        Self::with_events(session, token, total, Arc::new(NoEvents))
    }

    pub fn with_events(
        session: Arc<Session>,
        token: ProgressToken,
        total: Option<f64>,
        events: Arc<dyn ProgressEvents>,
    ) -> Self {
        events.on_start(&token);
        Self {
            session,
            token,
            total,
            min_interval: Duration::from_secs_f64(1.0 / DEFAULT_RATE_HZ),
            retry_band_ms: DEFAULT_RETRY_BAND,
            max_retries: DEFAULT_MAX_RETRIES,
            events,
            state: Mutex::new(TrackerState {
                last_reported: None,
                pending: None,
                last_emit: None,
                closed: false,
            }),
        }
    }

    /// Override the coalescing rate.
    pub fn with_rate_hz(mut self, hz: f64) -> Self {
        self.min_interval = Duration::from_secs_f64(1.0 / hz.max(0.001));
        self
    }

    /// Override the retry backoff band in milliseconds.
    pub fn with_retry_band_ms(mut self, band: Range<u64>) -> Self {
        self.retry_band_ms = band;
        self
    }

    /// Record a progress value.
    ///
    /// Values must be strictly increasing for the token; regressions are an
    /// error. Updates inside the coalescing window are held back and sent
    /// with the next emission or the final flush.
    pub async fn update(&self, progress: f64, message: Option<&str>) -> Result<()> {
        let to_send = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::InvalidRequest(
                    "progress tracker already closed".to_string(),
                ));
            }
            let pending_value = state.pending.as_ref().map(|(p, _)| *p);
            let floor = match (state.last_reported, pending_value) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            if let Some(floor) = floor {
                if progress <= floor {
                    return Err(Error::invalid_params_data(
                        format!("Progress must increase: {progress} <= {floor}"),
                        serde_json::json!({ "progress": progress, "floor": floor }),
                    ));
                }
            }

            let due = state
                .last_emit
                .map_or(true, |at| at.elapsed() >= self.min_interval);
            if due {
                state.last_emit = Some(Instant::now());
                state.pending = None;
                state.last_reported = Some(progress);
                Some((progress, message.map(String::from)))
            } else {
                // Inside the coalescing window: hold the value, it
                // supersedes any previously pending one.
                state.pending = Some((progress, message.map(String::from)));
                None
            }
        };

        if let Some((progress, message)) = to_send {
            self.emit(progress, message).await?;
        }
        Ok(())
    }

    /// Flush the last held value (if any) and close the tracker. The final
    /// value is delivered at least once, modulo a permanently dead
    /// transport.
    pub async fn close(&self) {
        let (pending, last) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let pending = state.pending.take();
            if let Some((progress, _)) = &pending {
                state.last_reported = Some(*progress);
            }
            (pending, state.last_reported)
        };

        if let Some((progress, message)) = pending {
            if let Err(e) = self.emit(progress, message).await {
                debug!(error = %e, "final progress flush failed");
            }
        }
        self.events.on_close(&self.token, last);
    }

    /// The last value reported (sent or pending).
    pub async fn last_value(&self) -> Option<f64> {
        let state = self.state.lock().await;
        state
            .pending
            .as_ref()
            .map(|(p, _)| *p)
            .or(state.last_reported)
    }

    async fn emit(&self, progress: f64, message: Option<String>) -> Result<()> {
        let params = ProgressParams {
            progress_token: self.token.clone(),
            progress,
            total: self.total,
            message,
        };
        let payload = serde_json::to_value(&params)?;

        let mut attempt = 0;
        loop {
            match self
                .session
                .send_notification(methods::PROGRESS, Some(payload.clone()))
                .await
            {
                Ok(()) => {
                    self.events.on_emit(&self.token, progress);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = rand::thread_rng().gen_range(self.retry_band_ms.clone());
                    debug!(attempt, backoff_ms = backoff, "progress send retry");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn make_session(buffer: usize) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Session::new("progress", tx), rx)
    }

    fn token() -> ProgressToken {
        ProgressToken::String("op-1".to_string())
    }

    fn drain_progress(rx: &mut mpsc::Receiver<Message>) -> Vec<f64> {
        let mut values = Vec::new();
        while let Ok(Message::Notification(n)) = rx.try_recv() {
            values.push(n.params.unwrap()["progress"].as_f64().unwrap());
        }
        values
    }

    #[tokio::test]
    async fn test_first_update_emits_immediately() {
        let (session, mut rx) = make_session(16);
        let tracker = ProgressTracker::new(session, token(), Some(100.0));

        tracker.update(10.0, Some("started")).await.unwrap();
        let values = drain_progress(&mut rx);
        assert_eq!(values, vec![10.0]);
    }

    #[tokio::test]
    async fn test_monotonicity_enforced() {
        let (session, _rx) = make_session(16);
        let tracker = ProgressTracker::new(session, token(), None);

        tracker.update(5.0, None).await.unwrap();
        let err = tracker.update(5.0, None).await.unwrap_err();
        assert_eq!(err.jsonrpc_code(), -32602);
        let err = tracker.update(4.0, None).await.unwrap_err();
        assert_eq!(err.jsonrpc_code(), -32602);
        tracker.update(6.0, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_burst_coalesces_and_final_value_flushes() {
        let (session, mut rx) = make_session(64);
        let tracker = ProgressTracker::new(session, token(), Some(100.0)).with_rate_hz(4.0);

        for i in 1..=20 {
            tracker.update(i as f64, None).await.unwrap();
        }
        tracker.close().await;

        let values = drain_progress(&mut rx);
        // Far fewer sends than updates, strictly increasing, ending on the
        // last value set before close.
        assert!(values.len() < 20, "burst not coalesced: {values:?}");
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*values.last().unwrap(), 20.0);
    }

    #[tokio::test]
    async fn test_close_without_pending_sends_nothing_more() {
        let (session, mut rx) = make_session(16);
        let tracker = ProgressTracker::new(session, token(), None);

        tracker.update(1.0, None).await.unwrap();
        drain_progress(&mut rx);
        tracker.close().await;
        assert!(drain_progress(&mut rx).is_empty());
        assert_eq!(tracker.last_value().await, Some(1.0));
    }

    #[tokio::test]
    async fn test_update_after_close_rejected() {
        let (session, _rx) = make_session(16);
        let tracker = ProgressTracker::new(session, token(), None);
        tracker.close().await;
        assert!(tracker.update(1.0, None).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_then_drop_on_dead_transport() {
        let (session, rx) = make_session(16);
        let tracker = ProgressTracker::new(session.clone(), token(), None)
            .with_retry_band_ms(1..2);

        // Closing the session makes sends fail permanently (not transient),
        // so the tracker gives up rather than spinning.
        drop(rx);
        session.close().await;
        let err = tracker.update(1.0, None).await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_with_backoff() {
        // Buffer of 1: the first notification fills it, the second send
        // fails as "buffer full" (transient) until the reader drains it.
        let (session, mut rx) = make_session(1);
        let tracker = ProgressTracker::new(session, token(), None)
            .with_rate_hz(10_000.0)
            .with_retry_band_ms(5..10);

        tracker.update(1.0, None).await.unwrap();

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4)).await;
            let mut got = Vec::new();
            while let Ok(m) = rx.try_recv() {
                if let Message::Notification(n) = m {
                    got.push(n.params.unwrap()["progress"].as_f64().unwrap());
                }
            }
            // Keep draining so the retried send eventually lands.
            loop {
                match rx.recv().await {
                    Some(Message::Notification(n)) => {
                        got.push(n.params.unwrap()["progress"].as_f64().unwrap());
                        break;
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
            got
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        tracker.update(2.0, None).await.unwrap();

        let got = reader.await.unwrap();
        assert_eq!(got, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_events_hooks_fire() {
        struct Counting {
            emits: AtomicUsize,
            closes: AtomicUsize,
        }
        impl ProgressEvents for Counting {
            fn on_emit(&self, _token: &ProgressToken, _progress: f64) {
                self.emits.fetch_add(1, Ordering::SeqCst);
            }
            fn on_close(&self, _token: &ProgressToken, _last: Option<f64>) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (session, _rx) = make_session(16);
        let events = Arc::new(Counting {
            emits: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        let tracker =
            ProgressTracker::with_events(session, token(), None, events.clone());

        tracker.update(1.0, None).await.unwrap();
        tracker.close().await;
        assert_eq!(events.emits.load(Ordering::SeqCst), 1);
        assert_eq!(events.closes.load(Ordering::SeqCst), 1);
    }
}
