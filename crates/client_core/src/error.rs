use shared::{domain::SessionId, error::ApiException};
use thiserror::Error;

use crate::reconciler::ReconcileError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("record store rejected the request: {0}")]
    Api(#[from] ApiException),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("invalid payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Rejected(#[from] ReconcileError),
    #[error("session controller has stopped")]
    ControllerStopped,
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode(value.to_string())
        } else {
            Self::Transport(value.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(value: url::ParseError) -> Self {
        Self::Transport(format!("invalid url: {value}"))
    }
}
