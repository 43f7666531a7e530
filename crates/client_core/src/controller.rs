//! Runs the reconciler against real collaborators.
//!
//! A [`SessionController`] owns one event loop task. User actions, change
//! feed snapshots and store responses are all funnelled through that loop so
//! they reach [`reconcile`] one at a time. Outbound writes are queued on a
//! separate writer task which sends them in the order they were produced and
//! never blocks the loop.

use std::sync::Arc;

use shared::{
    domain::SessionId,
    protocol::{NewSession, SessionPatch, SessionRecord},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    address::AddressBar,
    clipboard::{Clipboard, CopyIndicator},
    error::ClientError,
    reconciler::{reconcile, Action, Effect, Input, ReconcileError, Role, ViewState},
    store::{ChangeFeed, RecordStore, Subscription},
};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ViewChanged,
    Rejected(ReconcileError),
    AddressChanged(String),
    LinkCopied(String),
    SessionNotFound(SessionId),
    WriteFailed {
        session_id: SessionId,
        message: String,
    },
    FeedClosed(SessionId),
    Error(String),
}

/// Everything the controller talks to outside its own process state.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub address: Arc<dyn AddressBar>,
    pub clipboard: Arc<dyn Clipboard>,
}

enum Command {
    Apply {
        action: Action,
        reply: oneshot::Sender<Result<ViewState, ReconcileError>>,
    },
    Shutdown(oneshot::Sender<()>),
}

pub struct SessionController {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ViewState>,
    events: broadcast::Sender<ClientEvent>,
    copied: CopyIndicator,
    address: Arc<dyn AddressBar>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Starts the controller. If the address already names a session it is
    /// fetched and opened with `role` before any action is processed.
    pub fn spawn(collaborators: Collaborators, role: Role) -> Self {
        Self::spawn_with_state(collaborators, role, ViewState::default())
    }

    pub fn spawn_with_state(collaborators: Collaborators, role: Role, initial: ViewState) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view) = watch::channel(initial.clone());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let copied = CopyIndicator::default();
        let address = Arc::clone(&collaborators.address);

        let (writes, writer) = spawn_writer(Arc::clone(&collaborators.store), events.clone());
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            state: initial,
            role,
            collaborators,
            inputs,
            writes: Some(writes),
            writer: Some(writer),
            subscription: None,
            connecting: None,
            view_tx,
            events: events.clone(),
            copied: copied.clone(),
        };
        let task = tokio::spawn(event_loop.run(command_rx, input_rx));

        Self {
            commands,
            view,
            events,
            copied,
            address,
            task: Mutex::new(Some(task)),
        }
    }

    /// Applies one user action and returns the resulting view.
    pub async fn apply(&self, action: Action) -> Result<ViewState, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Apply { action, reply })
            .await
            .map_err(|_| ClientError::ControllerStopped)?;
        let outcome = rx.await.map_err(|_| ClientError::ControllerStopped)?;
        Ok(outcome?)
    }

    pub fn view(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }

    pub fn current(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The transient "link copied" flag.
    pub fn copied(&self) -> watch::Receiver<bool> {
        self.copied.watch()
    }

    pub fn link(&self) -> String {
        self.address.current_link()
    }

    /// Stops the loop, cancels the change-feed subscription and waits for
    /// queued writes to be sent.
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done)).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(err) = task.await {
            warn!(%err, "controller: event loop ended abnormally");
        }
    }
}

struct PendingWrite {
    session_id: SessionId,
    patch: SessionPatch,
}

fn spawn_writer(
    store: Arc<dyn RecordStore>,
    events: broadcast::Sender<ClientEvent>,
) -> (mpsc::UnboundedSender<PendingWrite>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PendingWrite>();
    let writer = tokio::spawn(async move {
        while let Some(PendingWrite { session_id, patch }) = rx.recv().await {
            match store.update(session_id, patch).await {
                Ok(_) => debug!(%session_id, "controller: write applied"),
                Err(err) => {
                    // The local view keeps the optimistic value.
                    warn!(%session_id, %err, "controller: write failed");
                    let _ = events.send(ClientEvent::WriteFailed {
                        session_id,
                        message: err.to_string(),
                    });
                }
            }
        }
    });
    (tx, writer)
}

struct EventLoop {
    state: ViewState,
    role: Role,
    collaborators: Collaborators,
    inputs: mpsc::UnboundedSender<Internal>,
    writes: Option<mpsc::UnboundedSender<PendingWrite>>,
    writer: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
    connecting: Option<SessionId>,
    view_tx: watch::Sender<ViewState>,
    events: broadcast::Sender<ClientEvent>,
    copied: CopyIndicator,
}

/// Results of work the loop handed off to spawned tasks.
enum Internal {
    Input(Input),
    Subscribed(Subscription),
    SubscribeFailed(SessionId),
}

enum Step {
    Command(Command),
    Internal(Internal),
    Remote(SessionRecord),
    FeedClosed(SessionId),
    Stop,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.open_from_address().await;

        let done = loop {
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Stop,
                },
                Some(internal) = inputs.recv() => Step::Internal(internal),
                snapshot = next_snapshot(&mut self.subscription) => match snapshot {
                    Ok(record) => Step::Remote(record),
                    Err(session_id) => Step::FeedClosed(session_id),
                },
            };

            match step {
                Step::Command(Command::Apply { action, reply }) => {
                    let outcome = self.handle(Input::Action(action)).await;
                    let _ = reply.send(outcome.map(|()| self.state.clone()));
                }
                Step::Command(Command::Shutdown(done)) => break Some(done),
                Step::Internal(Internal::Input(input)) => self.handle_quietly(input).await,
                Step::Internal(Internal::Subscribed(subscription)) => {
                    self.attach(subscription)
                }
                Step::Internal(Internal::SubscribeFailed(session_id)) => {
                    if self.connecting == Some(session_id) {
                        self.connecting = None;
                    }
                }
                Step::Remote(record) => self.handle_quietly(Input::Remote(record)).await,
                Step::FeedClosed(session_id) => {
                    warn!(%session_id, "controller: change feed closed");
                    self.subscription = None;
                    let _ = self.events.send(ClientEvent::FeedClosed(session_id));
                }
                Step::Stop => break None,
            }
        };

        self.stop().await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Opens the session named by the address. The feed is joined before
    /// the record is read, so no update between the two is lost; buffered
    /// snapshots are applied on top of the fetched record.
    async fn open_from_address(&mut self) {
        let Some(session_id) = self.collaborators.address.session_id() else {
            return;
        };
        match self.collaborators.feed.subscribe(session_id).await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(err) => {
                warn!(%session_id, %err, "controller: change feed subscription failed");
            }
        }

        let opened = match self.collaborators.store.fetch(session_id).await {
            Ok(Some(session)) => {
                let role = self.role;
                match self.handle(Input::Loaded { session, role }).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(%session_id, %err, "controller: linked session could not be opened");
                        false
                    }
                }
            }
            Ok(None) => {
                warn!(%session_id, "controller: linked session not found");
                let _ = self.events.send(ClientEvent::SessionNotFound(session_id));
                false
            }
            Err(err) => {
                warn!(%session_id, %err, "controller: failed to fetch linked session");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                false
            }
        };
        if !opened {
            if let Some(subscription) = self.subscription.take() {
                subscription.cancel();
            }
        }
    }

    async fn handle_quietly(&mut self, input: Input) {
        if let Err(err) = self.handle(input).await {
            debug!(%err, "controller: input ignored");
        }
    }

    async fn handle(&mut self, input: Input) -> Result<(), ReconcileError> {
        let transition = match reconcile(&self.state, input) {
            Ok(transition) => transition,
            Err(err) => {
                let _ = self.events.send(ClientEvent::Rejected(err.clone()));
                return Err(err);
            }
        };
        if transition.state != self.state {
            self.state = transition.state;
            self.view_tx.send_replace(self.state.clone());
            let _ = self.events.send(ClientEvent::ViewChanged);
        }
        for effect in transition.effects {
            self.perform(effect).await;
        }
        Ok(())
    }

    async fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::Create(session) => self.create(session),
            Effect::Write { session_id, patch } => {
                let queued = self
                    .writes
                    .as_ref()
                    .map(|writes| writes.send(PendingWrite { session_id, patch }).is_ok())
                    .unwrap_or(false);
                if !queued {
                    warn!(%session_id, "controller: writer stopped, write dropped");
                }
            }
            Effect::RewriteAddress(session_id) => {
                let link = self.collaborators.address.rewrite(session_id);
                info!(%session_id, %link, "controller: session published");
                let _ = self.events.send(ClientEvent::AddressChanged(link));
            }
            Effect::Subscribe(session_id) => self.subscribe(session_id),
            Effect::CopyLink => {
                let link = self.collaborators.address.current_link();
                match self.collaborators.clipboard.write_text(&link) {
                    Ok(()) => {
                        self.copied.mark_copied();
                        let _ = self.events.send(ClientEvent::LinkCopied(link));
                    }
                    Err(err) => {
                        warn!(%err, "controller: clipboard write failed");
                        let _ = self.events.send(ClientEvent::Error(err.to_string()));
                    }
                }
            }
        }
    }

    fn create(&self, session: NewSession) {
        let store = Arc::clone(&self.collaborators.store);
        let inputs = self.inputs.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let input = match store.insert(session).await {
                Ok(record) => Input::Created(record),
                Err(err) => {
                    warn!(%err, "controller: session creation failed");
                    let _ = events.send(ClientEvent::Error(err.to_string()));
                    Input::CreateFailed
                }
            };
            let _ = inputs.send(Internal::Input(input));
        });
    }

    /// Connects on a spawned task so actions keep flowing during the
    /// handshake. The connection comes back as [`Internal::Subscribed`].
    fn subscribe(&mut self, session_id: SessionId) {
        let current = self.subscription.as_ref().map(Subscription::session_id);
        if current == Some(session_id) || self.connecting == Some(session_id) {
            return;
        }
        if let Some(previous) = self.subscription.take() {
            previous.cancel();
        }
        self.connecting = Some(session_id);

        let feed = Arc::clone(&self.collaborators.feed);
        let inputs = self.inputs.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let internal = match feed.subscribe(session_id).await {
                Ok(subscription) => Internal::Subscribed(subscription),
                Err(err) => {
                    warn!(%session_id, %err, "controller: change feed subscription failed");
                    let _ = events.send(ClientEvent::Error(err.to_string()));
                    Internal::SubscribeFailed(session_id)
                }
            };
            // A closed loop drops the subscription, which stops its reader.
            let _ = inputs.send(internal);
        });
    }

    fn attach(&mut self, subscription: Subscription) {
        let session_id = subscription.session_id();
        if self.connecting == Some(session_id) {
            self.connecting = None;
        }
        if self.state.session_id() != Some(session_id) {
            debug!(%session_id, "controller: stale subscription dropped");
            subscription.cancel();
            return;
        }
        if let Some(previous) = self.subscription.replace(subscription) {
            previous.cancel();
        }
    }

    async fn stop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        // Closing the queue lets the writer drain what is already queued.
        self.writes = None;
        self.connecting = None;
        if let Some(writer) = self.writer.take() {
            if let Err(err) = writer.await {
                warn!(%err, "controller: writer ended abnormally");
            }
        }
        debug!("controller: stopped");
    }
}

/// Resolves with the next snapshot, or with the session id once the feed
/// ends. Never resolves while there is no subscription.
async fn next_snapshot(
    subscription: &mut Option<Subscription>,
) -> Result<SessionRecord, SessionId> {
    match subscription {
        Some(subscription) => match subscription.next().await {
            Some(record) => Ok(record),
            None => Err(subscription.session_id()),
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
