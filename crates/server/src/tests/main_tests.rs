use super::*;
use axum::{body, body::Body, http::Request};
use shared::domain::Card;
use tower::ServiceExt;

async fn test_app() -> (Router, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (events, _) = broadcast::channel(32);
    let state = Arc::new(AppState {
        api: ApiContext { storage },
        events,
        max_body_bytes: 64 * 1024,
    });
    (build_router(Arc::clone(&state)), state)
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn create(app: &Router, cards: Vec<Card>) -> SessionRecord {
    let request = Request::post("/sessions")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&NewSession::from_cards(cards)).expect("json"),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

fn patch_request(id: SessionId, patch: &SessionPatch) -> Request<Body> {
    Request::patch(format!("/sessions/{id}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(patch).expect("json")))
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _state) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn create_then_fetch_session() {
    let (app, _state) = test_app().await;
    let created = create(&app, vec![Card::new("a", "1")]).await;
    assert_eq!(created.cards.len(), 1);
    assert_eq!(created.current_index, 0);
    assert!(!created.is_live);

    let request = Request::get(format!("/sessions/{}", created.id))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let fetched: SessionRecord = json_body(response).await;
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn create_with_no_cards_is_a_validation_error() {
    let (app, state) = test_app().await;
    let request = Request::post("/sessions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"cards":[],"current_index":0,"is_live":false}"#))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ApiError = json_body(response).await;
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(state.api.storage.count_sessions().await.expect("count"), 0);
}

#[tokio::test]
async fn unknown_or_malformed_session_ids_are_not_found() {
    let (app, _state) = test_app().await;
    for path in [
        format!("/sessions/{}", SessionId::generate()),
        "/sessions/not-a-uuid".to_string(),
    ] {
        let request = Request::get(&path).body(Body::empty()).expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn patch_broadcasts_the_full_updated_record() {
    let (app, state) = test_app().await;
    let created = create(&app, vec![Card::new("a", "1"), Card::new("b", "2")]).await;
    let mut feed = state.events.subscribe();

    let response = app
        .clone()
        .oneshot(patch_request(created.id, &SessionPatch::is_live(true)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let updated: SessionRecord = json_body(response).await;
    assert!(updated.is_live);

    let event = feed.recv().await.expect("event");
    let ServerEvent::SessionUpdated { session } = event else {
        panic!("expected session update");
    };
    assert_eq!(session, updated);
    assert_eq!(session.cards.len(), 2);
}

#[tokio::test]
async fn rejected_patch_is_not_broadcast() {
    let (app, state) = test_app().await;
    let created = create(&app, vec![Card::new("a", "1")]).await;
    let mut feed = state.events.subscribe();

    let response = app
        .oneshot(patch_request(created.id, &SessionPatch::current_index(5)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(matches!(
        feed.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let (app, _state) = test_app().await;
    let huge = "x".repeat(128 * 1024);
    let payload =
        serde_json::to_vec(&NewSession::from_cards(vec![Card::new(huge, "1")])).expect("json");
    let request = Request::post("/sessions")
        .header("content-type", "application/json")
        .header("content-length", payload.len())
        .body(Body::from(payload))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

type Feed = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect_feed(addr: SocketAddr, id: SessionId) -> Feed {
    let (feed, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/sessions/{id}/changes"))
        .await
        .expect("ws connect");
    feed
}

async fn next_event(feed: &mut Feed, wait: std::time::Duration) -> Option<ServerEvent> {
    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    loop {
        let frame = tokio::time::timeout(wait, feed.next()).await.ok()??;
        match frame.expect("ws frame") {
            Message::Text(text) => return Some(serde_json::from_str(&text).expect("event json")),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn change_feed_delivers_only_the_watched_session() {
    let (app, state) = test_app().await;
    let watched = create(&app, vec![Card::new("a", "1"), Card::new("b", "2")]).await;
    let other = create(&app, vec![Card::new("x", "9")]).await;
    let addr = serve(app.clone()).await;

    let mut feed = connect_feed(addr, watched.id).await;
    assert_eq!(state.events.receiver_count(), 1);

    let response = app
        .clone()
        .oneshot(patch_request(other.id, &SessionPatch::is_live(true)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .clone()
        .oneshot(patch_request(watched.id, &SessionPatch::current_index(1)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let wait = std::time::Duration::from_secs(2);
    let Some(ServerEvent::SessionUpdated { session }) = next_event(&mut feed, wait).await else {
        panic!("expected session update");
    };
    assert_eq!(session.id, watched.id);
    assert_eq!(session.cards, watched.cards);
    assert_eq!(session.current_index, 1);
    assert!(!session.is_live);

    let extra = next_event(&mut feed, std::time::Duration::from_millis(200)).await;
    assert!(extra.is_none(), "unexpected frame: {extra:?}");
}

#[tokio::test]
async fn update_sent_right_after_connecting_is_delivered() {
    let (app, _state) = test_app().await;
    let created = create(&app, vec![Card::new("a", "1"), Card::new("b", "2")]).await;
    let addr = serve(app.clone()).await;

    for round in 0..20u32 {
        let mut feed = connect_feed(addr, created.id).await;
        let index = round % 2;
        let response = app
            .clone()
            .oneshot(patch_request(created.id, &SessionPatch::current_index(index)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let event = next_event(&mut feed, std::time::Duration::from_secs(2)).await;
        let Some(ServerEvent::SessionUpdated { session }) = event else {
            panic!("round {round}: no update after connecting");
        };
        assert_eq!(session.current_index, index, "round {round}");
    }
}

#[tokio::test]
async fn change_feed_for_unknown_session_is_refused() {
    let (app, state) = test_app().await;
    let addr = serve(app).await;

    let url = format!("ws://{addr}/sessions/{}/changes", SessionId::generate());
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
    assert_eq!(state.events.receiver_count(), 0);
}
