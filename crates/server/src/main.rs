use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use server_api::{create_session, get_session, update_session, ApiContext};
use shared::{
    domain::SessionId,
    error::{ApiError, ErrorCode},
    protocol::{NewSession, ServerEvent, SessionPatch, SessionRecord},
};
use storage::Storage;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let (events, _) = broadcast::channel(settings.broadcast_capacity);

    let state = AppState {
        api: ApiContext { storage },
        events,
        max_body_bytes: settings.max_body_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(http_create_session))
        .route(
            "/sessions/:session_id",
            get(http_get_session).patch(http_update_session),
        )
        .route("/sessions/:session_id/changes", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| api_error(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok("ok")
}

async fn http_create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewSession>,
) -> ApiResult<(StatusCode, Json<SessionRecord>)> {
    let session = create_session(&state.api, req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn http_get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionRecord>> {
    let session_id = parse_session_id(&session_id)?;
    let session = get_session(&state.api, session_id)
        .await
        .map_err(api_error)?;
    Ok(Json(session))
}

async fn http_update_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<Json<SessionRecord>> {
    let session_id = parse_session_id(&session_id)?;
    let event = update_session(&state.api, session_id, patch)
        .await
        .map_err(api_error)?;
    let ServerEvent::SessionUpdated { session } = &event else {
        return Err(api_error(ApiError::new(
            ErrorCode::Internal,
            "update produced no session record",
        )));
    };
    let session = session.clone();
    // No receivers just means nobody is following this session right now.
    let _ = state.events.send(event);
    Ok(Json(session))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session_id = parse_session_id(&session_id)?;
    get_session(&state.api, session_id)
        .await
        .map_err(api_error)?;
    // Join the fan-out before answering the handshake so that an update
    // sent right after the client connects is not missed.
    let events = state.events.subscribe();
    Ok(ws.on_upgrade(move |socket| ws_connection(socket, session_id, events)))
}

async fn ws_connection(
    socket: axum::extract::ws::WebSocket,
    session_id: SessionId,
    events: broadcast::Receiver<ServerEvent>,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(events);
    info!(%session_id, "change feed: follower connected");

    let send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%session_id, skipped, "change feed: follower lagged");
                    continue;
                }
            };
            if event.session_id() != Some(session_id) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(err) => {
                    error!(%session_id, %err, "change feed: failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    send_task.abort();
    debug!(%session_id, "change feed: follower disconnected");
}

fn parse_session_id(raw: &str) -> ApiResult<SessionId> {
    raw.parse()
        .map_err(|_| api_error(ApiError::not_found(format!("session {raw} not found"))))
}

fn api_error(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
