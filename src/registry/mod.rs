//! Weakly-referenced session registries.
//!
//! Two fan-out indices shared by the capability services:
//!
//! - [`ObserverRegistry`] tracks sessions interested in list-changed
//!   notifications. A session is (re-)armed whenever it performs a `*/list`
//!   call on a capability that advertises `list_changed`.
//! - [`SubscriptionRegistry`] is the bidirectional URI <-> session index
//!   behind `resources/subscribe` and `notifications/resources/updated`.
//!
//! Both hold `Weak<Session>` so a dropped session can never be notified, and
//! neither performs transport I/O while holding its lock: broadcasts snapshot
//! the target set, release the lock, then send.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::session::{Session, SessionId};

/// Sessions interested in list-changed fan-out.
#[derive(Default)]
pub struct ObserverRegistry {
    inner: Mutex<HashMap<SessionId, Weak<Session>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `session` for future broadcasts. Idempotent.
    pub async fn observe(&self, session: &Arc<Session>) {
        self.inner
            .lock()
            .await
            .insert(session.id().clone(), Arc::downgrade(session));
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.inner
            .lock()
            .await
            .get(id)
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Broadcast a notification to every live observer. Sessions whose
    /// delivery fails (or that have been dropped) are discarded afterwards.
    pub async fn broadcast(&self, method: &str, params: Option<Value>) {
        let snapshot: Vec<(SessionId, Weak<Session>)> = self
            .inner
            .lock()
            .await
            .iter()
            .map(|(id, weak)| (id.clone(), weak.clone()))
            .collect();

        let mut stale: Vec<SessionId> = Vec::new();
        for (id, weak) in snapshot {
            match weak.upgrade() {
                Some(session) => {
                    if let Err(e) = session.send_notification(method, params.clone()).await {
                        debug!(session = %id, error = %e, "observer delivery failed");
                        stale.push(id);
                    }
                }
                None => stale.push(id),
            }
            // Checkpoint between deliveries so a large observer set cannot
            // starve the scheduler.
            tokio::task::yield_now().await;
        }

        if !stale.is_empty() {
            let mut inner = self.inner.lock().await;
            for id in stale {
                inner.remove(&id);
            }
        }
    }

    /// Drop a session from the registry.
    pub async fn prune_session(&self, id: &SessionId) {
        self.inner.lock().await.remove(id);
    }
}

#[derive(Default)]
struct SubscriptionIndex {
    by_uri: HashMap<String, HashMap<SessionId, Weak<Session>>>,
    by_session: HashMap<SessionId, HashSet<String>>,
}

/// Bidirectional resource URI <-> session index.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<SubscriptionIndex>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `session` to `uri`. Both indices are updated in one
    /// critical section; repeated subscription is a no-op.
    pub async fn subscribe(&self, uri: &str, session: &Arc<Session>) {
        let mut inner = self.inner.lock().await;
        inner
            .by_uri
            .entry(uri.to_string())
            .or_default()
            .insert(session.id().clone(), Arc::downgrade(session));
        inner
            .by_session
            .entry(session.id().clone())
            .or_default()
            .insert(uri.to_string());
    }

    /// Unsubscribe `session` from `uri`, pruning empty entries. Repeated
    /// unsubscription is a no-op.
    pub async fn unsubscribe(&self, uri: &str, session_id: &SessionId) {
        let mut inner = self.inner.lock().await;
        if let Some(sessions) = inner.by_uri.get_mut(uri) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                inner.by_uri.remove(uri);
            }
        }
        if let Some(uris) = inner.by_session.get_mut(session_id) {
            uris.remove(uri);
            if uris.is_empty() {
                inner.by_session.remove(session_id);
            }
        }
    }

    pub async fn is_subscribed(&self, uri: &str, session_id: &SessionId) -> bool {
        self.inner
            .lock()
            .await
            .by_uri
            .get(uri)
            .and_then(|s| s.get(session_id))
            .is_some_and(|w| w.strong_count() > 0)
    }

    pub async fn subscription_count(&self, uri: &str) -> usize {
        self.inner
            .lock()
            .await
            .by_uri
            .get(uri)
            .map_or(0, |s| s.len())
    }

    /// Send a notification to every session subscribed to `uri`. The
    /// subscriber set is snapshotted first so no lock is held across sends;
    /// failed sessions are pruned from all their subscriptions afterwards.
    pub async fn notify(&self, uri: &str, method: &str, params: Option<Value>) {
        let snapshot: Vec<(SessionId, Weak<Session>)> = {
            let inner = self.inner.lock().await;
            match inner.by_uri.get(uri) {
                Some(sessions) => sessions
                    .iter()
                    .map(|(id, weak)| (id.clone(), weak.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut stale: Vec<SessionId> = Vec::new();
        for (id, weak) in snapshot {
            match weak.upgrade() {
                Some(session) => {
                    if let Err(e) = session.send_notification(method, params.clone()).await {
                        debug!(session = %id, uri, error = %e, "subscriber delivery failed");
                        stale.push(id);
                    }
                }
                None => stale.push(id),
            }
            tokio::task::yield_now().await;
        }

        for id in stale {
            self.prune_session(&id).await;
        }
    }

    /// Remove `session_id` from every URI it subscribed to, in one critical
    /// section.
    pub async fn prune_session(&self, session_id: &SessionId) {
        let mut inner = self.inner.lock().await;
        if let Some(uris) = inner.by_session.remove(session_id) {
            for uri in uris {
                if let Some(sessions) = inner.by_uri.get_mut(&uri) {
                    sessions.remove(session_id);
                    if sessions.is_empty() {
                        inner.by_uri.remove(&uri);
                    }
                }
            }
        }
    }

    /// Whether the registry holds no subscriptions at all. Used by tests to
    /// verify cleanup.
    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.by_uri.is_empty() && inner.by_session.is_empty()
    }
}
