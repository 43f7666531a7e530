use serde::{Deserialize, Serialize};

use crate::{
    domain::{Card, SessionId},
    error::ApiError,
};

/// Full row of the `flashcard_sessions` table as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub cards: Vec<Card>,
    pub current_index: u32,
    pub is_live: bool,
}

/// Insert payload; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub cards: Vec<Card>,
    pub current_index: u32,
    pub is_live: bool,
}

impl NewSession {
    pub fn from_cards(cards: Vec<Card>) -> Self {
        Self {
            cards,
            current_index: 0,
            is_live: false,
        }
    }
}

/// Partial update. Absent fields are left untouched; present fields are
/// overwritten unconditionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<Vec<Card>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_live: Option<bool>,
}

impl SessionPatch {
    pub fn current_index(index: u32) -> Self {
        Self {
            current_index: Some(index),
            ..Self::default()
        }
    }

    pub fn is_live(is_live: bool) -> Self {
        Self {
            is_live: Some(is_live),
            ..Self::default()
        }
    }

    pub fn cards(cards: Vec<Card>) -> Self {
        Self {
            cards: Some(cards),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_none() && self.current_index.is_none() && self.is_live.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionUpdated { session: SessionRecord },
    Error(ApiError),
}

impl ServerEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::SessionUpdated { session } => Some(session.id),
            Self::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_omits_absent_fields_on_the_wire() {
        let json = serde_json::to_value(SessionPatch::current_index(2)).expect("json");
        assert_eq!(json, serde_json::json!({ "current_index": 2 }));
    }

    #[test]
    fn server_event_uses_tagged_payload() {
        let event = ServerEvent::SessionUpdated {
            session: SessionRecord {
                id: SessionId::generate(),
                cards: vec![Card::new("a", "1")],
                current_index: 0,
                is_live: true,
            },
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "session_updated");
        assert_eq!(json["payload"]["session"]["is_live"], true);
    }
}
