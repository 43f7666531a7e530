use std::{collections::HashMap, fs, path::Path};

use tracing::warn;
use url::Url;

use crate::error::ClientError;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Base URL of the session store service.
    pub server_url: String,
    /// Base URL that share links are built on. Defaults to `server_url`.
    pub public_url: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            public_url: None,
        }
    }
}

impl ClientSettings {
    pub fn server_url(&self) -> Result<Url, ClientError> {
        Ok(Url::parse(self.server_url.trim())?)
    }

    pub fn public_url(&self) -> Result<Url, ClientError> {
        match self.public_url.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Ok(Url::parse(raw)?),
            _ => self.server_url(),
        }
    }
}

pub fn load_client_settings() -> ClientSettings {
    load_client_settings_from(Path::new("client.toml"))
}

pub fn load_client_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, &file_cfg),
            Err(err) => warn!(path = %path.display(), %err, "ignoring malformed client config"),
        }
    }

    if let Ok(v) = std::env::var("FLASHLIVE_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("FLASHLIVE_PUBLIC_URL") {
        settings.public_url = Some(v);
    }

    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("public_url").and_then(toml::Value::as_str) {
        settings.public_url = Some(v.to_string());
    }
}
