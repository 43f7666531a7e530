//! In-process record store and change feed.
//!
//! Mirrors the semantics of the HTTP service (partial last-write-wins
//! updates, full-record update notifications, no insert notifications) and
//! records every write so tests can assert on outbound traffic.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use shared::{
    domain::SessionId,
    error::{ApiError, ApiException},
    protocol::{NewSession, SessionPatch, SessionRecord},
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::warn;

use crate::{
    error::ClientError,
    store::{ChangeFeed, RecordStore, Subscription},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub session_id: SessionId,
    pub patch: SessionPatch,
}

#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<InMemoryState>,
}

struct InMemoryState {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    writes: Mutex<Vec<RecordedWrite>>,
    updates: broadcast::Sender<SessionRecord>,
    fail_writes: AtomicBool,
    subscribe_calls: AtomicUsize,
    active_subscriptions: Arc<AtomicUsize>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(InMemoryState {
                sessions: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
                updates,
                fail_writes: AtomicBool::new(false),
                subscribe_calls: AtomicUsize::new(0),
                active_subscriptions: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Seeds a session as if another client had created it.
    pub async fn seed(&self, session: NewSession) -> SessionRecord {
        let record = SessionRecord {
            id: SessionId::generate(),
            cards: session.cards,
            current_index: session.current_index,
            is_live: session.is_live,
        };
        self.inner
            .sessions
            .lock()
            .await
            .insert(record.id, record.clone());
        record
    }

    pub async fn session(&self, id: SessionId) -> Option<SessionRecord> {
        self.inner.sessions.lock().await.get(&id).cloned()
    }

    pub async fn writes(&self) -> Vec<RecordedWrite> {
        self.inner.writes.lock().await.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.active_subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for InMemoryBackend {
    async fn fetch(&self, id: SessionId) -> Result<Option<SessionRecord>, ClientError> {
        Ok(self.session(id).await)
    }

    async fn insert(&self, session: NewSession) -> Result<SessionRecord, ClientError> {
        if session.cards.is_empty() {
            return Err(ApiException::from(ApiError::validation(
                "a session needs at least one card",
            ))
            .into());
        }
        Ok(self.seed(session).await)
    }

    async fn update(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<SessionRecord, ClientError> {
        self.inner.writes.lock().await.push(RecordedWrite {
            session_id: id,
            patch: patch.clone(),
        });
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("simulated write failure".into()));
        }

        let record = {
            let mut sessions = self.inner.sessions.lock().await;
            let record = sessions.get_mut(&id).ok_or(ClientError::NotFound(id))?;
            if let Some(cards) = patch.cards {
                record.cards = cards;
            }
            if let Some(index) = patch.current_index {
                record.current_index = index;
            }
            if let Some(is_live) = patch.is_live {
                record.is_live = is_live;
            }
            record.clone()
        };
        let _ = self.inner.updates.send(record.clone());
        Ok(record)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, id: SessionId) -> Result<Subscription, ClientError> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.active_subscriptions.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.inner.active_subscriptions));

        let mut updates = self.inner.updates.subscribe();
        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            let _guard = guard;
            loop {
                match updates.recv().await {
                    Ok(record) if record.id == id => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %id, skipped, "memory feed: subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(id, rx, reader))
    }
}
