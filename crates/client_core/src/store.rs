//! Collaborator seams: the record store and its change feed.

use async_trait::async_trait;
use shared::{
    domain::SessionId,
    protocol::{NewSession, SessionPatch, SessionRecord},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::error::ClientError;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch(&self, id: SessionId) -> Result<Option<SessionRecord>, ClientError>;
    async fn insert(&self, session: NewSession) -> Result<SessionRecord, ClientError>;
    async fn update(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<SessionRecord, ClientError>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a feed of full post-update records for one session.
    async fn subscribe(&self, id: SessionId) -> Result<Subscription, ClientError>;
}

/// A live change-feed subscription. The reader task behind it stops when
/// the subscription is cancelled or dropped.
pub struct Subscription {
    session_id: SessionId,
    snapshots: mpsc::Receiver<SessionRecord>,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        session_id: SessionId,
        snapshots: mpsc::Receiver<SessionRecord>,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            session_id,
            snapshots,
            reader: Some(reader),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn next(&mut self) -> Option<SessionRecord> {
        self.snapshots.recv().await
    }

    pub fn cancel(mut self) {
        self.stop_reader();
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            self.snapshots.close();
            debug!(session_id = %self.session_id, "change feed: unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
