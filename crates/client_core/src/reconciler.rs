//! Session view-state reconciliation.
//!
//! [`reconcile`] is a pure function from the current [`ViewState`] and one
//! [`Input`] (a local action, a change-feed snapshot, or the outcome of a
//! store request) to the next state plus the outbound [`Effect`]s the
//! controller must perform. Nothing here touches the network.
//!
//! Inbound snapshots use the live-gated mirror policy: `is_live` is always
//! adopted, while `cards` and `current_index` are only adopted from snapshots
//! that are themselves live. A snapshot that ends a broadcast freezes the
//! local view where it is.
//!
//! There is no sequencing token on the shared record. An optimistic local
//! write and an inbound snapshot race, and whichever reaches this function
//! last wins.

use shared::{
    domain::{Card, CardSide, SessionId},
    protocol::{NewSession, SessionPatch, SessionRecord},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// How a client that opened a share link participates in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Presenter,
    Follower,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authoring {
    pub drafts: Vec<Card>,
    pub create_pending: bool,
}

impl Default for Authoring {
    fn default() -> Self {
        Self::with_drafts(vec![Card::new("", "")])
    }
}

impl Authoring {
    pub fn with_drafts(drafts: Vec<Card>) -> Self {
        Self {
            drafts,
            create_pending: false,
        }
    }

    /// Drafts that would actually be submitted by a launch.
    pub fn launchable_cards(&self) -> Vec<Card> {
        self.drafts
            .iter()
            .filter(|card| !card.is_blank())
            .cloned()
            .collect()
    }
}

/// Local view of a published session. `cards` is never empty and
/// `current_index` always addresses one of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    session_id: SessionId,
    cards: Vec<Card>,
    current_index: usize,
    is_live: bool,
    show_back: bool,
}

impl SessionView {
    pub fn from_record(record: SessionRecord) -> Result<Self, ReconcileError> {
        if record.cards.is_empty() {
            return Err(ReconcileError::NoCards);
        }
        let current_index = wrap_index(record.current_index as usize, record.cards.len());
        Ok(Self {
            session_id: record.id,
            cards: record.cards,
            current_index,
            is_live: record.is_live,
            show_back: false,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn show_back(&self) -> bool {
        self.show_back
    }

    pub fn current_card(&self) -> Option<&Card> {
        self.cards.get(self.current_index)
    }

    pub fn visible_side(&self) -> CardSide {
        if self.show_back {
            CardSide::Back
        } else {
            CardSide::Front
        }
    }

    fn set_index(&mut self, index: usize) {
        if index != self.current_index {
            self.current_index = index;
            self.show_back = false;
        }
    }

    fn replace_cards(&mut self, cards: Vec<Card>) {
        if cards.is_empty() {
            return;
        }
        self.cards = cards;
        let index = wrap_index(self.current_index, self.cards.len());
        self.set_index(index);
    }

    fn step(&mut self, direction: Direction) {
        let len = self.cards.len();
        self.current_index = match direction {
            Direction::Next => (self.current_index + 1) % len,
            Direction::Previous => (self.current_index + len - 1) % len,
        };
        self.show_back = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    Authoring(Authoring),
    Presenting(SessionView),
    Following(SessionView),
}

impl Default for ViewState {
    fn default() -> Self {
        Self::Authoring(Authoring::default())
    }
}

impl ViewState {
    pub fn session(&self) -> Option<&SessionView> {
        match self {
            Self::Authoring(_) => None,
            Self::Presenting(view) | Self::Following(view) => Some(view),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session().map(|view| view.session_id)
    }

    pub fn is_presenting(&self) -> bool {
        matches!(self, Self::Presenting(_))
    }
}

/// Things the local user can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    EditDraft {
        index: usize,
        side: CardSide,
        text: String,
    },
    AddDraft,
    Launch,
    Advance(Direction),
    ToggleReveal,
    ToggleLive,
    AddCard(Card),
    CopyLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Action(Action),
    /// Full record delivered by the change feed.
    Remote(SessionRecord),
    /// Initial fetch for a session id found in the address.
    Loaded {
        session: SessionRecord,
        role: Role,
    },
    Created(SessionRecord),
    CreateFailed,
}

impl From<Action> for Input {
    fn from(action: Action) -> Self {
        Self::Action(action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Create(NewSession),
    Write {
        session_id: SessionId,
        patch: SessionPatch,
    },
    RewriteAddress(SessionId),
    Subscribe(SessionId),
    CopyLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ViewState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn quiet(state: ViewState) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("at least one card with a front and a back is required")]
    NoCards,
    #[error("card front and back must both be filled in")]
    BlankCard,
    #[error("a session has already been created")]
    AlreadyCreated,
    #[error("a session is already being created")]
    CreateInFlight,
    #[error("no session is open")]
    NoSession,
    #[error("only the presenter can change the live broadcast")]
    NotPresenter,
    #[error("draft {index} does not exist")]
    DraftOutOfRange { index: usize },
}

pub fn wrap_index(index: usize, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        index % len
    }
}

pub fn reconcile(state: &ViewState, input: Input) -> Result<Transition, ReconcileError> {
    match input {
        Input::Action(action) => apply_action(state, action),
        Input::Remote(snapshot) => Ok(apply_remote(state, snapshot)),
        Input::Loaded { session, role } => load(state, session, role),
        Input::Created(session) => created(state, session),
        Input::CreateFailed => Ok(create_failed(state)),
    }
}

fn apply_action(state: &ViewState, action: Action) -> Result<Transition, ReconcileError> {
    match (state, action) {
        (ViewState::Authoring(authoring), Action::EditDraft { index, side, text }) => {
            let mut authoring = authoring.clone();
            let draft = authoring
                .drafts
                .get_mut(index)
                .ok_or(ReconcileError::DraftOutOfRange { index })?;
            match side {
                CardSide::Front => draft.front = text,
                CardSide::Back => draft.back = text,
            }
            Ok(Transition::quiet(ViewState::Authoring(authoring)))
        }
        (ViewState::Authoring(authoring), Action::AddDraft) => {
            let mut authoring = authoring.clone();
            authoring.drafts.push(Card::new("", ""));
            Ok(Transition::quiet(ViewState::Authoring(authoring)))
        }
        (ViewState::Authoring(authoring), Action::Launch) => {
            if authoring.create_pending {
                return Err(ReconcileError::CreateInFlight);
            }
            let cards = authoring.launchable_cards();
            if cards.is_empty() {
                return Err(ReconcileError::NoCards);
            }
            let mut authoring = authoring.clone();
            authoring.create_pending = true;
            Ok(Transition {
                state: ViewState::Authoring(authoring),
                effects: vec![Effect::Create(NewSession::from_cards(cards))],
            })
        }
        (ViewState::Authoring(authoring), Action::AddCard(card)) => {
            if card.is_blank() {
                return Err(ReconcileError::BlankCard);
            }
            let mut authoring = authoring.clone();
            authoring.drafts.push(card);
            Ok(Transition::quiet(ViewState::Authoring(authoring)))
        }
        (ViewState::Authoring(_), _) => Err(ReconcileError::NoSession),

        (_, Action::EditDraft { .. } | Action::AddDraft | Action::Launch) => {
            Err(ReconcileError::AlreadyCreated)
        }

        (ViewState::Presenting(view), Action::Advance(direction)) => {
            let mut view = view.clone();
            view.step(direction);
            let mut effects = Vec::new();
            if view.is_live {
                effects.push(Effect::Write {
                    session_id: view.session_id,
                    patch: SessionPatch::current_index(index_to_wire(view.current_index)),
                });
            }
            Ok(Transition {
                state: ViewState::Presenting(view),
                effects,
            })
        }
        (ViewState::Following(view), Action::Advance(direction)) => {
            let mut view = view.clone();
            view.step(direction);
            Ok(Transition::quiet(ViewState::Following(view)))
        }

        (ViewState::Presenting(view), Action::ToggleLive) => {
            let mut view = view.clone();
            view.is_live = !view.is_live;
            let effects = vec![Effect::Write {
                session_id: view.session_id,
                patch: SessionPatch::is_live(view.is_live),
            }];
            Ok(Transition {
                state: ViewState::Presenting(view),
                effects,
            })
        }
        (ViewState::Following(_), Action::ToggleLive) => Err(ReconcileError::NotPresenter),

        (_, Action::AddCard(card)) => {
            if card.is_blank() {
                return Err(ReconcileError::BlankCard);
            }
            let (mut view, rewrap) = split_session(state)?;
            let mut cards = view.cards.clone();
            cards.push(card);
            view.replace_cards(cards);
            let effects = vec![Effect::Write {
                session_id: view.session_id,
                patch: SessionPatch::cards(view.cards.clone()),
            }];
            Ok(Transition {
                state: rewrap(view),
                effects,
            })
        }

        (_, Action::ToggleReveal) => {
            let (mut view, rewrap) = split_session(state)?;
            view.show_back = !view.show_back;
            Ok(Transition::quiet(rewrap(view)))
        }

        (_, Action::CopyLink) => {
            if state.session().is_none() {
                return Err(ReconcileError::NoSession);
            }
            Ok(Transition {
                state: state.clone(),
                effects: vec![Effect::CopyLink],
            })
        }
    }
}

fn apply_remote(state: &ViewState, snapshot: SessionRecord) -> Transition {
    let Ok((mut view, rewrap)) = split_session(state) else {
        return Transition::quiet(state.clone());
    };
    if snapshot.id != view.session_id {
        return Transition::quiet(state.clone());
    }

    view.is_live = snapshot.is_live;
    if snapshot.is_live {
        view.replace_cards(snapshot.cards);
        let index = wrap_index(snapshot.current_index as usize, view.cards.len());
        view.set_index(index);
    }
    Transition::quiet(rewrap(view))
}

fn load(state: &ViewState, session: SessionRecord, role: Role) -> Result<Transition, ReconcileError> {
    if state.session().is_some() {
        return Err(ReconcileError::AlreadyCreated);
    }
    let view = SessionView::from_record(session)?;
    let effects = vec![Effect::Subscribe(view.session_id)];
    let state = match role {
        Role::Presenter => ViewState::Presenting(view),
        Role::Follower => ViewState::Following(view),
    };
    Ok(Transition { state, effects })
}

fn created(state: &ViewState, session: SessionRecord) -> Result<Transition, ReconcileError> {
    match state {
        ViewState::Authoring(authoring) if authoring.create_pending => {
            let view = SessionView::from_record(session)?;
            let session_id = view.session_id;
            Ok(Transition {
                state: ViewState::Presenting(view),
                effects: vec![
                    Effect::RewriteAddress(session_id),
                    Effect::Subscribe(session_id),
                ],
            })
        }
        ViewState::Authoring(_) => Err(ReconcileError::NoSession),
        _ => Err(ReconcileError::AlreadyCreated),
    }
}

fn create_failed(state: &ViewState) -> Transition {
    match state {
        ViewState::Authoring(authoring) => {
            let mut authoring = authoring.clone();
            authoring.create_pending = false;
            Transition::quiet(ViewState::Authoring(authoring))
        }
        _ => Transition::quiet(state.clone()),
    }
}

type Rewrap = fn(SessionView) -> ViewState;

fn split_session(state: &ViewState) -> Result<(SessionView, Rewrap), ReconcileError> {
    match state {
        ViewState::Presenting(view) => Ok((view.clone(), ViewState::Presenting as Rewrap)),
        ViewState::Following(view) => Ok((view.clone(), ViewState::Following as Rewrap)),
        ViewState::Authoring(_) => Err(ReconcileError::NoSession),
    }
}

fn index_to_wire(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
