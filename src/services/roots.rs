//! Roots capability service (server -> client).
//!
//! Caches each session's client-advertised filesystem roots, refreshes the
//! cache with a debounce when the client announces changes, and hands out
//! [`RootGuard`] reference monitors that validate paths against the cached
//! snapshot. Pagination cursors embed the snapshot version so they go stale
//! across refreshes.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::pagination;
use crate::protocol::methods;
use crate::protocol::types::{ListRootsResult, Root};
use crate::session::{Session, SessionId};

/// Reference monitor ensuring paths stay within allowed roots.
///
/// An empty snapshot denies everything.
pub struct RootGuard {
    paths: Vec<PathBuf>,
}

impl RootGuard {
    pub fn new(roots: &[Root]) -> Self {
        Self {
            paths: roots.iter().map(|r| canonicalize_reference(&r.uri)).collect(),
        }
    }

    pub fn empty() -> Self {
        Self { paths: Vec::new() }
    }

    /// Whether `candidate` equals one of the roots or lives underneath one.
    pub fn within(&self, candidate: impl AsRef<str>) -> bool {
        if self.paths.is_empty() {
            return false;
        }
        let path = canonicalize_reference(candidate.as_ref());
        self.paths
            .iter()
            .any(|root| path == *root || path.starts_with(root) && path != *root)
    }
}

/// Turn a textual path or `file://` URI into an absolute, normalized path.
///
/// Symlinks are followed for the part of the path that exists; the rest is
/// resolved lexically so traversal components cannot escape.
fn canonicalize_reference(value: &str) -> PathBuf {
    let raw = if value.starts_with("file://") {
        file_uri_to_path(value)
    } else {
        PathBuf::from(value)
    };

    let expanded = expand_home(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    };

    normalize_case(follow_existing(normalize_lexically(&absolute)))
}

fn file_uri_to_path(value: &str) -> PathBuf {
    if let Ok(url) = Url::parse(value) {
        // On Windows this is the platform conversion: it yields drive-letter
        // paths for file:///C:/... and UNC paths for file://server/share.
        if let Ok(path) = url.to_file_path() {
            return path;
        }
        let decoded = percent_decode(url.path());
        return match url.host_str() {
            Some(host) if !host.eq_ignore_ascii_case("localhost") => {
                remote_host_path(host, &decoded)
            }
            _ => PathBuf::from(decoded),
        };
    }
    PathBuf::from(percent_decode(value.trim_start_matches("file://")))
}

/// Spell a `file://host/...` URI as a local path when the URL crate could
/// not: a UNC path on Windows, a host-prefixed absolute path elsewhere.
#[cfg(windows)]
fn remote_host_path(host: &str, decoded: &str) -> PathBuf {
    PathBuf::from(format!(r"\\{host}{}", decoded.replace('/', r"\")))
}

#[cfg(not(windows))]
fn remote_host_path(host: &str, decoded: &str) -> PathBuf {
    PathBuf::from(format!("/{host}{decoded}"))
}

/// Windows paths compare case-insensitively; fold them so `within` checks
/// are stable regardless of how the client spelled the path.
#[cfg(windows)]
fn normalize_case(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(s.to_lowercase().replace('/', r"\")),
        None => path,
    }
}

#[cfg(not(windows))]
fn normalize_case(path: PathBuf) -> PathBuf {
    path
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &input[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn expand_home(path: PathBuf) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path;
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or(path);
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn follow_existing(path: PathBuf) -> PathBuf {
    if let Ok(real) = std::fs::canonicalize(&path) {
        return real;
    }
    let mut existing = path.clone();
    while !existing.exists() {
        if !existing.pop() {
            return path;
        }
    }
    match (std::fs::canonicalize(&existing), path.strip_prefix(&existing)) {
        (Ok(real), Ok(rest)) => real.join(rest),
        _ => path,
    }
}

struct CacheEntry {
    version: u64,
    snapshot: Vec<Root>,
    guard: Arc<RootGuard>,
}

/// Roots service: per-session snapshot cache with debounced refresh.
pub struct RootsService {
    entries: Mutex<HashMap<SessionId, CacheEntry>>,
    debouncers: Mutex<HashMap<SessionId, JoinHandle<()>>>,
    debounce: Duration,
    page_size: usize,
}

impl RootsService {
    pub fn new(debounce: Duration, page_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            debouncers: Mutex::new(HashMap::new()),
            debounce,
            page_size,
        }
    }

    /// Populate the cache when a session finishes initializing.
    pub async fn on_session_open(&self, session: &Arc<Session>) {
        if session.supports_roots().await {
            if let Err(e) = self.refresh(session).await {
                debug!(session = %session.id(), error = %e, "initial roots fetch failed");
            }
        }
    }

    /// Handle `notifications/roots/list_changed`: start or restart the
    /// quiet-period timer; the refresh runs after it elapses. Bursts of
    /// notifications coalesce into one refresh.
    pub async fn on_list_changed(self: Arc<Self>, session: &Arc<Session>) {
        let mut debouncers = self.debouncers.lock().await;
        if let Some(previous) = debouncers.remove(session.id()) {
            previous.abort();
        }

        let service = self.clone();
        let session = session.clone();
        let delay = self.debounce;
        let id = session.id().clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = service.refresh(&session).await {
                debug!(session = %session.id(), error = %e, "roots refresh failed");
            }
        });
        debouncers.insert(id, handle);
    }

    /// Fetch a fresh snapshot from the client and bump the version if it
    /// actually changed.
    pub async fn refresh(&self, session: &Arc<Session>) -> Result<Vec<Root>> {
        let snapshot = self.fetch_snapshot(session).await?;

        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.get(session.id()) {
            if previous.snapshot == snapshot {
                return Ok(previous.snapshot.clone());
            }
        }
        let version = entries.get(session.id()).map_or(1, |e| e.version + 1);
        entries.insert(
            session.id().clone(),
            CacheEntry {
                version,
                guard: Arc::new(RootGuard::new(&snapshot)),
                snapshot: snapshot.clone(),
            },
        );
        Ok(snapshot)
    }

    async fn fetch_snapshot(&self, session: &Arc<Session>) -> Result<Vec<Root>> {
        let mut roots: Vec<Root> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let value = session.send_request(methods::ROOTS_LIST, params).await?;
            let page: ListRootsResult = serde_json::from_value(value)
                .map_err(|e| Error::Internal(format!("malformed roots/list result: {e}")))?;

            roots.extend(page.roots);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Last registration wins per URI; order is stable across refreshes.
        let mut dedup: HashMap<String, Root> = HashMap::new();
        for root in roots {
            dedup.insert(root.uri.clone(), root);
        }
        let mut snapshot: Vec<Root> = dedup.into_values().collect();
        snapshot.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(snapshot)
    }

    /// Serve a page of the cached snapshot, fetching it first on cache miss.
    /// Cursors from an older snapshot version are rejected.
    pub async fn list(
        &self,
        session: &Arc<Session>,
        cursor: Option<&str>,
    ) -> Result<ListRootsResult> {
        let cached = {
            let entries = self.entries.lock().await;
            entries
                .get(session.id())
                .map(|e| (e.version, e.snapshot.clone()))
        };

        let (version, snapshot) = match cached {
            Some(found) => found,
            None => {
                self.refresh(session).await?;
                let entries = self.entries.lock().await;
                entries
                    .get(session.id())
                    .map(|e| (e.version, e.snapshot.clone()))
                    .unwrap_or((0, Vec::new()))
            }
        };

        let offset = match cursor {
            Some(c) => pagination::decode_versioned(c, version)?,
            None => 0,
        };

        if offset >= snapshot.len() {
            return Ok(ListRootsResult {
                roots: Vec::new(),
                next_cursor: None,
            });
        }
        let end = (offset + self.page_size).min(snapshot.len());
        let next_cursor =
            (end < snapshot.len()).then(|| pagination::encode_versioned(version, end));
        Ok(ListRootsResult {
            roots: snapshot[offset..end].to_vec(),
            next_cursor,
        })
    }

    /// The reference monitor for the session's current snapshot. Sessions
    /// without a snapshot get a guard that denies everything.
    pub async fn guard(&self, session_id: &SessionId) -> Arc<RootGuard> {
        self.entries
            .lock()
            .await
            .get(session_id)
            .map(|e| e.guard.clone())
            .unwrap_or_else(|| Arc::new(RootGuard::empty()))
    }

    pub async fn version(&self, session_id: &SessionId) -> u64 {
        self.entries
            .lock()
            .await
            .get(session_id)
            .map_or(0, |e| e.version)
    }

    pub async fn prune_session(&self, session_id: &SessionId) {
        if let Some(handle) = self.debouncers.lock().await.remove(session_id) {
            handle.abort();
        }
        self.entries.lock().await.remove(session_id);
    }
}
