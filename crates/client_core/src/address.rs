//! Share links and the address bar abstraction.
//!
//! A share link is the public URL with a `session` query parameter. The
//! address bar holds the link for this client and is rewritten in place
//! once a session exists.

use std::sync::Mutex;

use shared::domain::SessionId;
use url::Url;

pub const SESSION_QUERY_PARAM: &str = "session";

pub trait AddressBar: Send + Sync {
    /// Session id carried by the current address, if any.
    fn session_id(&self) -> Option<SessionId>;
    fn current_link(&self) -> String;
    /// Embeds `session_id` in the address without any navigation.
    fn rewrite(&self, session_id: SessionId) -> String;
}

pub fn share_link(public_url: &Url, session_id: SessionId) -> Url {
    let mut link = public_url.clone();
    let kept: Vec<(String, String)> = public_url
        .query_pairs()
        .filter(|(key, _)| key != SESSION_QUERY_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut query = link.query_pairs_mut();
        query.clear();
        for (key, value) in &kept {
            query.append_pair(key, value);
        }
        query.append_pair(SESSION_QUERY_PARAM, &session_id.to_string());
    }
    link
}

pub fn session_from_url(url: &Url) -> Option<SessionId> {
    url.query_pairs()
        .find(|(key, _)| key == SESSION_QUERY_PARAM)
        .and_then(|(_, value)| value.parse().ok())
}

/// Accepts either a bare session id or a full share link.
pub fn parse_session_reference(raw: &str) -> Option<SessionId> {
    let raw = raw.trim();
    if let Ok(id) = raw.parse::<SessionId>() {
        return Some(id);
    }
    Url::parse(raw).ok().as_ref().and_then(session_from_url)
}

/// Address bar held in memory; the terminal front end prints from it.
pub struct LinkAddressBar {
    current: Mutex<Url>,
}

impl LinkAddressBar {
    pub fn new(address: Url) -> Self {
        Self {
            current: Mutex::new(address),
        }
    }

    pub fn current_url(&self) -> Url {
        match self.current.lock() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AddressBar for LinkAddressBar {
    fn session_id(&self) -> Option<SessionId> {
        session_from_url(&self.current_url())
    }

    fn current_link(&self) -> String {
        self.current_url().to_string()
    }

    fn rewrite(&self, session_id: SessionId) -> String {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = share_link(&current, session_id);
        current.to_string()
    }
}
