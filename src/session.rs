//! Session store: token -> per-client navigation state, with idle expiry.

use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Random bytes per session token.
pub const TOKEN_BYTES: usize = 16;

/// Default idle time after which a session is swept (5 minutes).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Default period of the expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-client navigation state.
#[derive(Debug, Clone)]
pub struct Session {
    pub current_dir: PathBuf,
    pub created_at: Instant,
    pub last_access: Instant,
}

/// Snapshot of a session taken under the store lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub token: String,
    pub current_dir: PathBuf,
    /// The token was minted by this call and must be sent to the client.
    pub is_new: bool,
}

/// Thread-safe session storage shared by every request handler.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: Arc<PathBuf>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionStore {
    /// Creates an empty store whose new sessions start at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Looks up `token` and refreshes it, or creates a fresh session rooted at
    /// root when the token is absent, empty or unknown.
    pub async fn resolve(&self, token: Option<&str>) -> ResolvedSession {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        if let Some(token) = token.filter(|t| !t.is_empty()) {
            if let Some(session) = sessions.get_mut(token) {
                session.last_access = now;
                debug!(token = short(token), "session refreshed");
                return ResolvedSession {
                    token: token.to_string(),
                    current_dir: session.current_dir.clone(),
                    is_new: false,
                };
            }
            debug!(token = short(token), "unknown session token, issuing a new one");
        }

        let token = loop {
            let candidate = generate_token();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(
            token.clone(),
            Session {
                current_dir: self.root.as_ref().clone(),
                created_at: now,
                last_access: now,
            },
        );
        info!(token = short(&token), "created session");

        ResolvedSession {
            token,
            current_dir: self.root.as_ref().clone(),
            is_new: true,
        }
    }

    /// Commits a new current directory. No-op if the session has expired.
    pub async fn update(&self, token: &str, current_dir: PathBuf) {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(token) {
            Some(session) => {
                session.current_dir = current_dir;
                session.last_access = Instant::now();
            }
            None => debug!(token = short(token), "update for vanished session ignored"),
        }
    }

    /// Deletes a session. Returns whether it existed.
    pub async fn remove(&self, token: &str) -> bool {
        match self.sessions.lock().await.remove(token) {
            Some(session) => {
                let age = session.created_at.elapsed();
                info!(token = short(token), age_secs = age.as_secs(), "session closed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of one session, if present. Does not refresh it.
    pub async fn get(&self, token: &str) -> Option<Session> {
        self.sessions.lock().await.get(token).cloned()
    }

    /// Removes every session idle for longer than `ttl`; returns how many.
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|token, session| {
            let keep = now.duration_since(session.last_access) <= ttl;
            if !keep {
                info!(token = short(token), "expired idle session");
            }
            keep
        });
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawns the periodic expiry sweep. It stops when `shutdown` is cancelled.
    pub fn spawn_sweeper(
        &self,
        every: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.sweep(ttl).await;
                        if removed > 0 {
                            info!(removed, "session sweep finished");
                        }
                    }
                }
            }
        })
    }
}

/// Mints a token: [`TOKEN_BYTES`] bytes from the OS CSPRNG, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Token prefix that is safe to put in logs.
pub(crate) fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn store() -> SessionStore {
        SessionStore::new("/srv/data")
    }

    #[test]
    fn tokens_are_fixed_length_hex() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn missing_or_empty_token_creates_session_at_root() {
        let store = store();
        let first = store.resolve(None).await;
        assert!(first.is_new);
        assert_eq!(first.current_dir, PathBuf::from("/srv/data"));

        let second = store.resolve(Some("")).await;
        assert!(second.is_new);
        assert_ne!(first.token, second.token);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn unknown_token_is_replaced_silently() {
        let store = store();
        let resolved = store.resolve(Some("deadbeef")).await;
        assert!(resolved.is_new);
        assert_ne!(resolved.token, "deadbeef");
        assert!(store.get("deadbeef").await.is_none());
    }

    #[tokio::test]
    async fn known_token_returns_current_directory() {
        let store = store();
        let created = store.resolve(None).await;
        store
            .update(&created.token, PathBuf::from("/srv/data/foo"))
            .await;

        let again = store.resolve(Some(&created.token)).await;
        assert!(!again.is_new);
        assert_eq!(again.token, created.token);
        assert_eq!(again.current_dir, PathBuf::from("/srv/data/foo"));
    }

    #[tokio::test]
    async fn update_after_remove_is_a_noop() {
        let store = store();
        let created = store.resolve(None).await;
        assert!(store.remove(&created.token).await);
        assert!(!store.remove(&created.token).await);

        store
            .update(&created.token, PathBuf::from("/srv/data/foo"))
            .await;
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_idle_sessions() {
        let store = store();
        let ttl = Duration::from_secs(300);
        let idle = store.resolve(None).await;
        let busy = store.resolve(None).await;

        advance(Duration::from_secs(200)).await;
        store.resolve(Some(&busy.token)).await;
        assert_eq!(store.sweep(ttl).await, 0);

        advance(Duration::from_secs(100)).await;
        assert_eq!(store.sweep(ttl).await, 0, "exactly at the ttl is kept");

        advance(Duration::from_secs(1)).await;
        assert_eq!(store.sweep(ttl).await, 1);
        assert!(store.get(&idle.token).await.is_none());
        assert!(store.get(&busy.token).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_yields_fresh_root_session() {
        let store = store();
        let created = store.resolve(None).await;
        store
            .update(&created.token, PathBuf::from("/srv/data/deep"))
            .await;

        advance(DEFAULT_SESSION_TTL + Duration::from_secs(1)).await;
        store.sweep(DEFAULT_SESSION_TTL).await;

        let resolved = store.resolve(Some(&created.token)).await;
        assert!(resolved.is_new);
        assert_eq!(resolved.current_dir, PathBuf::from("/srv/data"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_periodically_until_cancelled() {
        let store = store();
        let shutdown = CancellationToken::new();
        let handle = store.spawn_sweeper(
            Duration::from_secs(60),
            Duration::from_secs(90),
            shutdown.clone(),
        );
        store.resolve(None).await;

        // With the clock paused, sleeping lets the sweeper's timer fire first.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.len().await, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.is_empty().await);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn short_token_never_panics() {
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("0123456789abcdef"), "01234567");
    }
}
