use anyhow::{anyhow, Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::{
    domain::{Card, SessionId},
    protocol::{NewSession, SessionPatch, SessionRecord},
};

const SESSION_COLUMNS: &str = "id, cards, current_index, is_live";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens its own database, so an
        // in-memory store must stay on a single long-lived connection.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn insert_session(&self, session: &NewSession) -> Result<SessionRecord> {
        let id = SessionId::generate();
        let cards = encode_cards(&session.cards)?;
        let row = sqlx::query(&format!(
            "INSERT INTO flashcard_sessions (id, cards, current_index, is_live)
             VALUES (?, ?, ?, ?)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(cards)
        .bind(i64::from(session.current_index))
        .bind(session.is_live)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert flashcard session")?;
        debug!(session_id = %id, cards = session.cards.len(), "storage: inserted session");
        session_from_row(&row)
    }

    pub async fn fetch_session(&self, id: SessionId) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM flashcard_sessions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Overwrites the fields present in `patch`. Returns `None` when no row
    /// has this id.
    pub async fn update_session(
        &self,
        id: SessionId,
        patch: &SessionPatch,
    ) -> Result<Option<SessionRecord>> {
        let cards = patch.cards.as_deref().map(encode_cards).transpose()?;
        let row = sqlx::query(&format!(
            "UPDATE flashcard_sessions
             SET cards = COALESCE(?, cards),
                 current_index = COALESCE(?, current_index),
                 is_live = COALESCE(?, is_live),
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(cards)
        .bind(patch.current_index.map(i64::from))
        .bind(patch.is_live)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to update flashcard session {id}"))?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn count_sessions(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flashcard_sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    let raw_id: String = row.try_get(0)?;
    let id = SessionId::from_str(&raw_id)
        .map_err(|err| anyhow!("stored session id '{raw_id}' is not a uuid: {err}"))?;
    let cards: Vec<Card> = serde_json::from_str(&row.try_get::<String, _>(1)?)
        .with_context(|| format!("stored cards for session {id} are not valid json"))?;
    let current_index = u32::try_from(row.try_get::<i64, _>(2)?)
        .with_context(|| format!("stored current_index for session {id} is out of range"))?;
    Ok(SessionRecord {
        id,
        cards,
        current_index,
        is_live: row.try_get::<bool, _>(3)?,
    })
}

fn encode_cards(cards: &[Card]) -> Result<String> {
    serde_json::to_string(cards).context("failed to encode cards")
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
