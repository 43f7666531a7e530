use shared::{
    domain::{Card, SessionId},
    error::{ApiError, ErrorCode},
    protocol::{NewSession, SessionPatch, SessionRecord, ServerEvent},
};
use storage::Storage;
use tracing::info;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn create_session(
    ctx: &ApiContext,
    session: NewSession,
) -> Result<SessionRecord, ApiError> {
    validate_cards(&session.cards)?;
    validate_index(session.current_index, session.cards.len())?;

    let record = ctx
        .storage
        .insert_session(&session)
        .await
        .map_err(internal)?;
    info!(session_id = %record.id, cards = record.cards.len(), "api: session created");
    Ok(record)
}

pub async fn get_session(ctx: &ApiContext, id: SessionId) -> Result<SessionRecord, ApiError> {
    ctx.storage
        .fetch_session(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(id))
}

/// Applies a last-write-wins partial update and returns the change-feed
/// event carrying the full post-update record.
pub async fn update_session(
    ctx: &ApiContext,
    id: SessionId,
    mut patch: SessionPatch,
) -> Result<ServerEvent, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::validation("update must set at least one field"));
    }
    if let Some(cards) = &patch.cards {
        validate_cards(cards)?;
    }

    let current = get_session(ctx, id).await?;
    let card_count = patch.cards.as_ref().map_or(current.cards.len(), Vec::len);
    match patch.current_index {
        Some(index) => validate_index(index, card_count)?,
        // A shorter card list pulls the stored index back into range.
        None if patch.cards.is_some() => {
            let wrapped = wrap_index(current.current_index, card_count);
            if wrapped != current.current_index {
                patch.current_index = Some(wrapped);
            }
        }
        None => {}
    }

    let session = ctx
        .storage
        .update_session(id, &patch)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(id))?;
    info!(
        session_id = %id,
        current_index = session.current_index,
        is_live = session.is_live,
        cards = session.cards.len(),
        "api: session updated"
    );
    Ok(ServerEvent::SessionUpdated { session })
}

fn validate_cards(cards: &[Card]) -> Result<(), ApiError> {
    if cards.is_empty() {
        return Err(ApiError::validation("a session needs at least one card"));
    }
    if let Some(position) = cards.iter().position(Card::is_blank) {
        return Err(ApiError::validation(format!(
            "card {} has a blank front or back",
            position + 1
        )));
    }
    Ok(())
}

fn validate_index(index: u32, card_count: usize) -> Result<(), ApiError> {
    if usize::try_from(index).map_or(true, |index| index >= card_count) {
        return Err(ApiError::validation(format!(
            "current_index {index} is outside 0..{card_count}"
        )));
    }
    Ok(())
}

fn wrap_index(index: u32, card_count: usize) -> u32 {
    match u32::try_from(card_count) {
        Ok(count) if count > 0 => index % count,
        _ => index,
    }
}

fn not_found(id: SessionId) -> ApiError {
    ApiError::new(ErrorCode::NotFound, format!("session {id} not found"))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
