use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use shared::domain::{Card, CardSide};
use url::Url;

use super::*;
use crate::{
    address::{share_link, LinkAddressBar},
    clipboard::MemoryClipboard,
    memory::InMemoryBackend,
    reconciler::{Authoring, Direction, SessionView},
};

const PUBLIC_URL: &str = "http://localhost:8787/";

struct Harness {
    backend: InMemoryBackend,
    address: Arc<LinkAddressBar>,
    clipboard: Arc<MemoryClipboard>,
}

impl Harness {
    fn new(address: Url) -> Self {
        Self {
            backend: InMemoryBackend::new(),
            address: Arc::new(LinkAddressBar::new(address)),
            clipboard: Arc::new(MemoryClipboard::default()),
        }
    }

    fn blank() -> Self {
        Self::new(Url::parse(PUBLIC_URL).expect("url"))
    }

    fn linked(backend: &InMemoryBackend, session_id: SessionId) -> Self {
        let link = share_link(&Url::parse(PUBLIC_URL).expect("url"), session_id);
        Self {
            backend: backend.clone(),
            ..Self::new(link)
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: Arc::new(self.backend.clone()),
            feed: Arc::new(self.backend.clone()),
            address: self.address.clone(),
            clipboard: self.clipboard.clone(),
        }
    }

    fn spawn(&self, role: Role) -> SessionController {
        SessionController::spawn(self.collaborators(), role)
    }
}

fn deck(n: usize) -> Vec<Card> {
    (0..n)
        .map(|i| Card::new(format!("front {i}"), format!("back {i}")))
        .collect()
}

async fn seed(backend: &InMemoryBackend, cards: usize, is_live: bool) -> SessionId {
    let mut session = NewSession::from_cards(deck(cards));
    session.is_live = is_live;
    backend.seed(session).await.id
}

async fn wait_for_view(
    controller: &SessionController,
    predicate: impl FnMut(&ViewState) -> bool,
) -> ViewState {
    let mut view = controller.view();
    let state = tokio::time::timeout(Duration::from_secs(5), view.wait_for(predicate))
        .await
        .expect("timed out waiting for view")
        .expect("controller stopped");
    state.clone()
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn session(state: &ViewState) -> &SessionView {
    state.session().expect("session view")
}

#[tokio::test]
async fn launch_publishes_one_card_and_rewrites_the_address() {
    let harness = Harness::blank();
    let controller = harness.spawn(Role::Follower);

    for (side, text) in [(CardSide::Front, "hola"), (CardSide::Back, "hello")] {
        controller
            .apply(Action::EditDraft {
                index: 0,
                side,
                text: text.into(),
            })
            .await
            .expect("edit draft");
    }
    controller.apply(Action::Launch).await.expect("launch");

    let state = wait_for_view(&controller, ViewState::is_presenting).await;
    let view = session(&state);
    assert_eq!(view.cards(), [Card::new("hola", "hello")]);
    assert_eq!(view.current_index(), 0);
    assert!(!view.is_live());
    assert!(!view.show_back());

    assert_eq!(harness.address.session_id(), Some(view.session_id()));
    let stored = harness
        .backend
        .session(view.session_id())
        .await
        .expect("stored session");
    assert_eq!(stored.current_index, 0);
    assert!(!stored.is_live);

    wait_until(|| async { harness.backend.active_subscriptions() == 1 }).await;
    assert_eq!(harness.backend.subscribe_calls(), 1);
    assert!(harness.backend.writes().await.is_empty());
    controller.shutdown().await;
}

#[tokio::test]
async fn launch_without_cards_is_rejected() {
    let harness = Harness::blank();
    let controller = harness.spawn(Role::Presenter);

    let err = controller
        .apply(Action::Launch)
        .await
        .expect_err("blank drafts");
    assert!(matches!(err, ClientError::Rejected(ReconcileError::NoCards)));
    assert!(matches!(controller.current(), ViewState::Authoring(_)));
    controller.shutdown().await;
}

#[tokio::test]
async fn live_presenter_writes_each_index_in_order() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 3, true).await;
    let harness = Harness::linked(&backend, id);
    let controller = harness.spawn(Role::Presenter);

    controller
        .apply(Action::Advance(Direction::Next))
        .await
        .expect("advance");
    controller
        .apply(Action::Advance(Direction::Next))
        .await
        .expect("advance");

    wait_until(|| async { backend.writes().await.len() == 2 }).await;
    let patches: Vec<_> = backend.writes().await.into_iter().map(|w| w.patch).collect();
    assert_eq!(
        patches,
        vec![SessionPatch::current_index(1), SessionPatch::current_index(2)]
    );
    assert_eq!(backend.session(id).await.expect("session").current_index, 2);
    wait_for_view(&controller, |state| {
        state.session().map(|view| view.current_index()) == Some(2)
    })
    .await;
    controller.shutdown().await;
}

#[tokio::test]
async fn going_live_then_advancing_writes_flag_then_index() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 3, false).await;
    let harness = Harness::linked(&backend, id);
    let controller = harness.spawn(Role::Presenter);

    controller.apply(Action::ToggleLive).await.expect("toggle");
    controller
        .apply(Action::Advance(Direction::Next))
        .await
        .expect("advance");
    controller.shutdown().await;

    let patches: Vec<_> = backend.writes().await.into_iter().map(|w| w.patch).collect();
    assert_eq!(
        patches,
        vec![SessionPatch::is_live(true), SessionPatch::current_index(1)]
    );
    let stored = backend.session(id).await.expect("session");
    assert!(stored.is_live);
    assert_eq!(stored.current_index, 1);
}

#[tokio::test]
async fn failed_write_keeps_the_optimistic_view() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 3, true).await;
    backend.fail_writes(true);
    let harness = Harness::linked(&backend, id);
    let controller = harness.spawn(Role::Presenter);
    let mut events = controller.subscribe_events();

    let state = controller
        .apply(Action::Advance(Direction::Next))
        .await
        .expect("advance");
    assert_eq!(session(&state).current_index(), 1);

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::WriteFailed { session_id, .. }) => break session_id,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("write failure event");
    assert_eq!(failed, id);
    assert_eq!(session(&controller.current()).current_index(), 1);
    assert_eq!(backend.session(id).await.expect("session").current_index, 0);
    controller.shutdown().await;
}

#[tokio::test]
async fn unknown_link_stays_in_authoring() {
    let backend = InMemoryBackend::new();
    let harness = Harness::linked(&backend, SessionId::generate());
    let controller = harness.spawn(Role::Follower);

    let err = controller
        .apply(Action::CopyLink)
        .await
        .expect_err("no session");
    assert!(matches!(err, ClientError::Rejected(ReconcileError::NoSession)));
    assert!(matches!(controller.current(), ViewState::Authoring(_)));
    assert_eq!(backend.subscribe_calls(), 1);
    wait_until(|| async { backend.active_subscriptions() == 0 }).await;
    assert!(harness.clipboard.contents().is_empty());
    controller.shutdown().await;
}

#[tokio::test]
async fn follower_mirrors_a_live_presenter_and_freezes_when_it_stops() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 3, true).await;
    let presenter_side = Harness::linked(&backend, id);
    let follower_side = Harness::linked(&backend, id);
    let presenter = presenter_side.spawn(Role::Presenter);
    let follower = follower_side.spawn(Role::Follower);
    wait_until(|| async { backend.active_subscriptions() == 2 }).await;

    presenter
        .apply(Action::Advance(Direction::Next))
        .await
        .expect("advance");
    wait_for_view(&follower, |state| {
        state.session().map(|view| view.current_index()) == Some(1)
    })
    .await;
    presenter.shutdown().await;

    // Another presenter ends the broadcast and keeps navigating.
    RecordStore::update(&backend, id, SessionPatch::is_live(false))
        .await
        .expect("stop live");
    wait_for_view(&follower, |state| {
        state.session().map(|view| view.is_live()) == Some(false)
    })
    .await;
    RecordStore::update(&backend, id, SessionPatch::current_index(2))
        .await
        .expect("frozen advance");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session(&follower.current()).current_index(), 1);

    let state = follower
        .apply(Action::Advance(Direction::Previous))
        .await
        .expect("local advance");
    assert_eq!(session(&state).current_index(), 0);
    assert!(matches!(
        follower.apply(Action::ToggleLive).await,
        Err(ClientError::Rejected(ReconcileError::NotPresenter))
    ));
    follower.shutdown().await;

    let patches: Vec<_> = backend.writes().await.into_iter().map(|w| w.patch).collect();
    assert_eq!(
        patches,
        vec![
            SessionPatch::current_index(1),
            SessionPatch::is_live(false),
            SessionPatch::current_index(2),
        ]
    );
}

#[tokio::test]
async fn follower_added_card_reaches_the_store() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 2, false).await;
    let harness = Harness::linked(&backend, id);
    let controller = harness.spawn(Role::Follower);

    let state = controller
        .apply(Action::AddCard(Card::new("gato", "cat")))
        .await
        .expect("add card");
    assert_eq!(session(&state).cards().len(), 3);
    controller.shutdown().await;

    let stored = backend.session(id).await.expect("session");
    assert_eq!(stored.cards.len(), 3);
    assert_eq!(stored.cards[2], Card::new("gato", "cat"));
}

#[tokio::test]
async fn shutdown_cancels_the_only_subscription() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 1, false).await;
    let harness = Harness::linked(&backend, id);
    let controller = harness.spawn(Role::Presenter);

    wait_until(|| async { backend.active_subscriptions() == 1 }).await;
    controller.shutdown().await;
    wait_until(|| async { backend.active_subscriptions() == 0 }).await;
    assert_eq!(backend.subscribe_calls(), 1);

    assert!(matches!(
        controller.apply(Action::ToggleReveal).await,
        Err(ClientError::ControllerStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn copy_link_fills_the_clipboard_and_resets_the_indicator() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 1, false).await;
    let harness = Harness::linked(&backend, id);
    let controller = harness.spawn(Role::Presenter);
    let copied = controller.copied();

    controller.apply(Action::CopyLink).await.expect("copy");
    assert_eq!(harness.clipboard.contents(), vec![controller.link()]);
    assert!(controller.link().contains(&id.to_string()));
    assert!(*copied.borrow());

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert!(!*copied.borrow());
    controller.shutdown().await;
}

/// Store whose read lands just before another client's write.
struct WriteAfterReadStore {
    backend: InMemoryBackend,
    write: SessionPatch,
}

#[async_trait]
impl RecordStore for WriteAfterReadStore {
    async fn fetch(&self, id: SessionId) -> Result<Option<SessionRecord>, ClientError> {
        let record = self.backend.fetch(id).await?;
        self.backend.update(id, self.write.clone()).await?;
        Ok(record)
    }

    async fn insert(&self, session: NewSession) -> Result<SessionRecord, ClientError> {
        self.backend.insert(session).await
    }

    async fn update(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<SessionRecord, ClientError> {
        self.backend.update(id, patch).await
    }
}

#[tokio::test]
async fn update_landing_right_after_the_initial_read_still_arrives() {
    let backend = InMemoryBackend::new();
    let id = seed(&backend, 3, true).await;
    let harness = Harness::linked(&backend, id);
    let collaborators = Collaborators {
        store: Arc::new(WriteAfterReadStore {
            backend: backend.clone(),
            write: SessionPatch::current_index(2),
        }),
        ..harness.collaborators()
    };
    let follower = SessionController::spawn(collaborators, Role::Follower);

    let state = wait_for_view(&follower, |state| {
        state.session().map(|view| view.current_index()) == Some(2)
    })
    .await;
    assert!(session(&state).is_live());
    assert_eq!(backend.subscribe_calls(), 1);
    follower.shutdown().await;
}

/// Feed whose handshake waits until the test lets it through.
struct GatedFeed {
    backend: InMemoryBackend,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ChangeFeed for GatedFeed {
    async fn subscribe(&self, id: SessionId) -> Result<Subscription, ClientError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ClientError::Transport("gate closed".into()))?;
        self.backend.subscribe(id).await
    }
}

#[tokio::test]
async fn actions_are_not_held_up_by_a_slow_feed_handshake() {
    let harness = Harness::blank();
    let gate = Arc::new(Semaphore::new(0));
    let collaborators = Collaborators {
        feed: Arc::new(GatedFeed {
            backend: harness.backend.clone(),
            gate: Arc::clone(&gate),
        }),
        ..harness.collaborators()
    };
    let controller = SessionController::spawn_with_state(
        collaborators,
        Role::Presenter,
        ViewState::Authoring(Authoring::with_drafts(deck(2))),
    );

    controller.apply(Action::Launch).await.expect("launch");
    wait_for_view(&controller, ViewState::is_presenting).await;

    let state = tokio::time::timeout(
        Duration::from_secs(1),
        controller.apply(Action::Advance(Direction::Next)),
    )
    .await
    .expect("action handled while the feed is still connecting")
    .expect("advance");
    assert_eq!(session(&state).current_index(), 1);
    assert_eq!(harness.backend.active_subscriptions(), 0);

    gate.add_permits(1);
    wait_until(|| async { harness.backend.active_subscriptions() == 1 }).await;
    assert_eq!(harness.backend.subscribe_calls(), 1);
    controller.shutdown().await;
}

#[tokio::test]
async fn launch_from_drafts_skips_blank_rows() {
    let harness = Harness::blank();
    let controller = SessionController::spawn_with_state(
        harness.collaborators(),
        Role::Presenter,
        ViewState::Authoring(Authoring::with_drafts(vec![
            Card::new("a", "1"),
            Card::new("b", ""),
        ])),
    );

    controller.apply(Action::Launch).await.expect("launch");
    let state = wait_for_view(&controller, ViewState::is_presenting).await;
    assert_eq!(session(&state).cards(), [Card::new("a", "1")]);
    controller.shutdown().await;
}
