//! Logging capability service.
//!
//! Tracks each session's minimum severity from `logging/setLevel` and fans
//! structured log records out as `notifications/message` to every session
//! whose threshold admits them. Stale sessions are pruned after delivery
//! failure.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::protocol::methods;
use crate::protocol::types::{LoggingLevel, LoggingMessageParams};
use crate::session::{Session, SessionId};

/// Logging service: per-session thresholds and message fan-out.
#[derive(Default)]
pub struct LoggingService {
    sessions: Mutex<HashMap<SessionId, (Weak<Session>, LoggingLevel)>>,
}

impl LoggingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// `logging/setLevel` for the calling session. Unknown levels were
    /// already rejected at parse time.
    pub async fn set_level(&self, session: &Arc<Session>, level: LoggingLevel) -> Result<()> {
        session.set_log_threshold(level).await;
        self.sessions
            .lock()
            .await
            .insert(session.id().clone(), (Arc::downgrade(session), level));
        Ok(())
    }

    /// Emit a structured log record to every session whose threshold admits
    /// `level`. Sessions that fail delivery (or have been dropped) are
    /// pruned afterwards.
    pub async fn emit(&self, level: LoggingLevel, data: Value, logger: Option<&str>) {
        let targets: Vec<(SessionId, Weak<Session>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, (_, threshold))| level >= *threshold)
                .map(|(id, (weak, _))| (id.clone(), weak.clone()))
                .collect()
        };

        if targets.is_empty() {
            return;
        }

        let params = LoggingMessageParams {
            level,
            logger: logger.map(String::from),
            data,
        };
        let payload = serde_json::to_value(&params).ok();

        let mut stale: Vec<SessionId> = Vec::new();
        for (id, weak) in targets {
            match weak.upgrade() {
                Some(session) => {
                    if let Err(e) = session
                        .send_notification(methods::LOGGING_MESSAGE, payload.clone())
                        .await
                    {
                        debug!(session = %id, error = %e, "log delivery failed");
                        stale.push(id);
                    }
                }
                None => stale.push(id),
            }
        }

        if !stale.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for id in stale {
                sessions.remove(&id);
            }
        }
    }

    pub async fn prune_session(&self, id: &SessionId) {
        self.sessions.lock().await.remove(id);
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }
}
