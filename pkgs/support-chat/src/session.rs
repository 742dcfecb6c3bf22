//! Session timer for the user widget
//!
//! A session lives for a fixed TTL counted from its first message. On expiry
//! the transcript is cleared and the expiry flag is persisted so a restart
//! does not bring the old transcript back.

use crate::error::Result;
use crate::events::{ChatEvent, ClearReason};
use crate::message_store::MessageStore;
use crate::timing::{Clock, TaskGuard};
use crate::transport::TransportClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// User-side session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Set by the first message of the session
    pub started_at: Option<i64>,
    pub ttl_ms: i64,
    pub expired: bool,
}

impl Session {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            started_at: None,
            ttl_ms,
            expired: false,
        }
    }

    /// `now - started_at >= ttl`; a session that never started cannot expire
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expired
            || self
                .started_at
                .is_some_and(|started| now.saturating_sub(started) >= self.ttl_ms)
    }
}

/// Where the session record survives restarts
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
}

/// Session record as a small JSON file
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionPersistence for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// Volatile persistence, for tests and embedders without a disk
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    session: Mutex<Option<Session>>,
}

#[async_trait]
impl SessionPersistence for InMemorySessionStore {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(*self.session.lock())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.session.lock() = Some(*session);
        Ok(())
    }
}

/// Enforces the session TTL for one conversation
pub struct SessionTimer {
    conversation_id: String,
    session: Mutex<Session>,
    store: Arc<MessageStore>,
    transport: Arc<TransportClient>,
    persistence: Arc<dyn SessionPersistence>,
    clock: Arc<dyn Clock>,
}

impl SessionTimer {
    pub fn new(
        conversation_id: impl Into<String>,
        ttl_ms: i64,
        store: Arc<MessageStore>,
        transport: Arc<TransportClient>,
        persistence: Arc<dyn SessionPersistence>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            session: Mutex::new(Session::new(ttl_ms)),
            store,
            transport,
            persistence,
            clock,
        }
    }

    pub fn session(&self) -> Session {
        *self.session.lock()
    }

    pub fn is_expired(&self) -> bool {
        self.session.lock().expired
    }

    async fn persist(&self) {
        let session = self.session();
        if let Err(e) = self.persistence.save(&session).await {
            warn!(conversation_id = %self.conversation_id, "Failed to persist session: {}", e);
        }
    }

    /// Load the persisted record. A session that expired while we were away
    /// clears whatever transcript is present.
    pub async fn restore(&self) -> Result<Session> {
        let Some(mut saved) = self.persistence.load().await? else {
            return Ok(self.session());
        };

        let ttl_ms = self.session.lock().ttl_ms;
        saved.ttl_ms = ttl_ms;
        let now = self.clock.now_millis();
        let lapsed = !saved.expired && saved.is_expired_at(now);
        if saved.is_expired_at(now) {
            saved.expired = true;
            self.store
                .clear(&self.conversation_id, ClearReason::SessionExpired);
        }
        *self.session.lock() = saved;
        if lapsed {
            self.persist().await;
        }

        info!(
            conversation_id = %self.conversation_id,
            expired = saved.expired,
            started_at = ?saved.started_at,
            "Restored session"
        );
        Ok(saved)
    }

    /// Record activity. The first message of a session starts the TTL clock.
    pub async fn touch(&self) {
        let started = {
            let mut session = self.session.lock();
            if session.expired {
                false
            } else if session.started_at.is_none() {
                session.started_at = Some(self.clock.now_millis());
                true
            } else {
                false
            }
        };
        if started {
            debug!(conversation_id = %self.conversation_id, "Session clock started");
            self.persist().await;
        }
    }

    /// Periodic check. Returns `true` when this call expired the session.
    pub async fn check(&self) -> bool {
        let now = self.clock.now_millis();
        let expired_now = {
            let mut session = self.session.lock();
            if session.expired || !session.is_expired_at(now) {
                false
            } else {
                session.expired = true;
                true
            }
        };
        if !expired_now {
            return false;
        }

        let removed = self
            .store
            .clear(&self.conversation_id, ClearReason::SessionExpired);
        info!(conversation_id = %self.conversation_id, removed, "Session expired");
        self.persist().await;

        let ended = ChatEvent::SessionEnded {
            conversation_id: self.conversation_id.clone(),
        };
        if let Err(e) = self.transport.emit(ended).await {
            warn!(conversation_id = %self.conversation_id, "Could not announce session end: {}", e);
        }
        true
    }

    /// The peer closed the conversation; expire regardless of the TTL clock
    pub async fn end_by_peer(&self) {
        let changed = {
            let mut session = self.session.lock();
            !std::mem::replace(&mut session.expired, true)
        };
        self.store
            .clear(&self.conversation_id, ClearReason::SessionEnded);
        if changed {
            info!(conversation_id = %self.conversation_id, "Session ended by support");
            self.persist().await;
        }
    }

    /// Start over: the next message starts a fresh TTL
    pub async fn start_new(&self) {
        {
            let mut session = self.session.lock();
            session.started_at = None;
            session.expired = false;
        }
        self.store
            .clear(&self.conversation_id, ClearReason::NewSession);
        info!(conversation_id = %self.conversation_id, "Started new session");
        self.persist().await;
    }

    /// Run [`check`](Self::check) every `interval` until the guard is dropped
    pub fn spawn_watchdog(self: &Arc<Self>, interval: Duration) -> TaskGuard {
        let timer = Arc::clone(self);
        TaskGuard::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                timer.check().await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Message, MessageKind, Sender};
    use crate::timing::ManualClock;
    use crate::transport::MemoryHub;

    const TTL: i64 = 1_800_000;

    struct Fixture {
        hub: MemoryHub,
        store: Arc<MessageStore>,
        clock: Arc<ManualClock>,
        persistence: Arc<InMemorySessionStore>,
        timer: Arc<SessionTimer>,
    }

    async fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let transport = Arc::new(TransportClient::new(Arc::new(hub.transport()), 8));
        transport.connect().await.unwrap();
        let store = Arc::new(MessageStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let persistence = Arc::new(InMemorySessionStore::default());
        let timer = Arc::new(SessionTimer::new(
            "u1",
            TTL,
            store.clone(),
            transport,
            persistence.clone(),
            clock.clone(),
        ));
        Fixture {
            hub,
            store,
            clock,
            persistence,
            timer,
        }
    }

    fn add_message(store: &MessageStore, timestamp: i64) {
        store
            .append(Message::outgoing(
                "u1",
                Sender::User,
                MessageKind::Text,
                "hi",
                timestamp,
            ))
            .unwrap();
    }

    #[test]
    fn test_ttl_boundary() {
        let session = Session {
            started_at: Some(1_000),
            ttl_ms: TTL,
            expired: false,
        };
        assert!(!session.is_expired_at(1_000 + TTL - 1));
        assert!(session.is_expired_at(1_000 + TTL));
        assert!(!Session::new(TTL).is_expired_at(i64::MAX));
    }

    #[tokio::test]
    async fn test_ttl_counts_from_first_message() {
        let f = fixture().await;
        f.clock.set(5_000);
        assert!(!f.timer.check().await);
        assert_eq!(f.timer.session().started_at, None);

        f.timer.touch().await;
        f.clock.set(10_000);
        f.timer.touch().await;
        assert_eq!(f.timer.session().started_at, Some(5_000));
    }

    #[tokio::test]
    async fn test_check_expires_clears_and_announces() {
        let f = fixture().await;
        f.timer.touch().await;
        add_message(&f.store, 0);

        f.clock.set(TTL - 1);
        assert!(!f.timer.check().await);
        f.clock.set(TTL);
        assert!(f.timer.check().await);
        assert!(!f.timer.check().await);

        assert!(f.timer.is_expired());
        assert!(f.store.is_empty("u1"));
        assert_eq!(f.persistence.load().await.unwrap().map(|s| s.expired), Some(true));
        assert_eq!(
            f.hub
                .count_received(|e| matches!(e, ChatEvent::SessionEnded { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_restore_expired_session_clears_transcript() {
        let f = fixture().await;
        f.persistence
            .save(&Session {
                started_at: Some(0),
                ttl_ms: TTL,
                expired: false,
            })
            .await
            .unwrap();
        add_message(&f.store, 0);
        f.clock.set(TTL + 5);

        let restored = f.timer.restore().await.unwrap();
        assert!(restored.expired);
        assert!(f.store.is_empty("u1"));
        assert_eq!(f.persistence.load().await.unwrap().map(|s| s.expired), Some(true));
    }

    #[tokio::test]
    async fn test_start_new_resets() {
        let f = fixture().await;
        f.timer.touch().await;
        f.clock.set(TTL);
        f.timer.check().await;

        f.timer.start_new().await;
        let session = f.timer.session();
        assert_eq!(session.started_at, None);
        assert!(!session.expired);

        f.clock.set(TTL + 100);
        f.timer.touch().await;
        assert_eq!(f.timer.session().started_at, Some(TTL + 100));
    }

    #[tokio::test]
    async fn test_end_by_peer_does_not_echo() {
        let f = fixture().await;
        add_message(&f.store, 0);
        f.timer.end_by_peer().await;

        assert!(f.timer.is_expired());
        assert!(f.store.is_empty("u1"));
        assert_eq!(f.hub.count_received(|_| true), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_stops_when_dropped() {
        let f = fixture().await;
        f.timer.touch().await;
        f.clock.set(TTL);

        let guard = f.timer.spawn_watchdog(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(f.timer.is_expired());
        drop(guard);

        f.timer.start_new().await;
        f.timer.touch().await;
        f.clock.set(TTL * 3);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!f.timer.is_expired());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));
        assert_eq!(store.load().await.unwrap(), None);

        let session = Session {
            started_at: Some(42),
            ttl_ms: TTL,
            expired: true,
        };
        store.save(&session).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(session));
    }
}
