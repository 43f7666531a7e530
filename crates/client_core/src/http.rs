use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::SessionId,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{NewSession, ServerEvent, SessionPatch, SessionRecord},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ClientError,
    store::{ChangeFeed, RecordStore, Subscription},
};

const SNAPSHOT_BUFFER: usize = 64;

/// Record store backed by the flashlive HTTP service.
#[derive(Clone)]
pub struct HttpRecordStore {
    http: Client,
    server_url: Url,
}

impl HttpRecordStore {
    pub fn new(server_url: Url) -> Self {
        Self {
            http: Client::new(),
            server_url,
        }
    }

    fn session_url(&self, id: Option<SessionId>) -> Result<Url, ClientError> {
        let path = match id {
            Some(id) => format!("sessions/{id}"),
            None => "sessions".to_string(),
        };
        Ok(with_trailing_slash(&self.server_url).join(&path)?)
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn fetch(&self, id: SessionId) -> Result<Option<SessionRecord>, ClientError> {
        let res = self.http.get(self.session_url(Some(id))?).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(decode(res).await?))
    }

    async fn insert(&self, session: NewSession) -> Result<SessionRecord, ClientError> {
        let res = self
            .http
            .post(self.session_url(None)?)
            .json(&session)
            .send()
            .await?;
        decode(res).await
    }

    async fn update(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<SessionRecord, ClientError> {
        let res = self
            .http
            .patch(self.session_url(Some(id))?)
            .json(&patch)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(id));
        }
        decode(res).await
    }
}

async fn decode(res: Response) -> Result<SessionRecord, ClientError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res.json::<SessionRecord>().await?);
    }
    let body = res.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        ApiError::new(
            ErrorCode::Internal,
            format!("unexpected status {status}: {body}"),
        )
    });
    Err(ApiException::from(error).into())
}

/// Change feed over the service's per-session WebSocket.
#[derive(Clone)]
pub struct WsChangeFeed {
    server_url: Url,
}

impl WsChangeFeed {
    pub fn new(server_url: Url) -> Self {
        Self { server_url }
    }

    fn changes_url(&self, id: SessionId) -> Result<Url, ClientError> {
        let mut url =
            with_trailing_slash(&self.server_url).join(&format!("sessions/{id}/changes"))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ClientError::Transport(format!(
                    "server_url must use http or https, got {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Transport("failed to derive websocket url".into()))?;
        Ok(url)
    }
}

#[async_trait]
impl ChangeFeed for WsChangeFeed {
    async fn subscribe(&self, id: SessionId) -> Result<Subscription, ClientError> {
        let ws_url = self.changes_url(id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (ws_writer, mut ws_reader) = ws_stream.split();
        info!(session_id = %id, "change feed: subscribed");

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let reader = tokio::spawn(async move {
            let _writer = ws_writer;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::SessionUpdated { session }) if session.id == id => {
                            if tx.send(session).await.is_err() {
                                break;
                            }
                        }
                        Ok(ServerEvent::SessionUpdated { session }) => {
                            debug!(expected = %id, got = %session.id, "change feed: foreign update ignored");
                        }
                        Ok(ServerEvent::Error(err)) => {
                            warn!(session_id = %id, code = ?err.code, message = %err.message, "change feed: server error");
                        }
                        Err(err) => {
                            warn!(session_id = %id, %err, "change feed: invalid server event");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(session_id = %id, %err, "change feed: websocket receive failed");
                        break;
                    }
                }
            }
            debug!(session_id = %id, "change feed: reader finished");
        });

        Ok(Subscription::new(id, rx, reader))
    }
}

fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_url_switches_to_websocket_scheme() {
        let id = SessionId::generate();
        let feed = WsChangeFeed::new(Url::parse("https://cards.example/api").expect("url"));
        assert_eq!(
            feed.changes_url(id).expect("ws url").as_str(),
            format!("wss://cards.example/api/sessions/{id}/changes")
        );

        let feed = WsChangeFeed::new(Url::parse("http://127.0.0.1:8787").expect("url"));
        assert!(feed
            .changes_url(id)
            .expect("ws url")
            .as_str()
            .starts_with("ws://127.0.0.1:8787/sessions/"));
    }

    #[test]
    fn non_http_server_url_is_rejected() {
        let feed = WsChangeFeed::new(Url::parse("ftp://cards.example").expect("url"));
        assert!(matches!(
            feed.changes_url(SessionId::generate()),
            Err(ClientError::Transport(_))
        ));
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod transport_tests;
