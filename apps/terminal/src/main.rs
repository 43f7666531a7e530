use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::load_client_settings, parse_session_reference, share_link, Action, Authoring,
    ClientEvent, Collaborators, HttpRecordStore, LinkAddressBar, Role, SessionController, ViewState,
    WsChangeFeed,
};
use shared::domain::Card;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use url::Url;

mod clipboard;
mod commands;
mod render;

use clipboard::SystemClipboard;
use commands::{parse_card, parse_command, Command, HELP};

#[derive(Parser, Debug)]
#[command(name = "flashlive", about = "Present or follow a live flashcard session")]
struct Args {
    /// Session store service, overrides client.toml and FLASHLIVE_SERVER_URL.
    #[arg(long, global = true)]
    server_url: Option<String>,
    /// Base URL for share links.
    #[arg(long, global = true)]
    public_url: Option<String>,
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Author cards and publish a new session.
    Create {
        /// Initial card as `front=back`; repeatable.
        #[arg(long = "card")]
        cards: Vec<String>,
    },
    /// Open an existing session and drive it.
    Present { session: String },
    /// Open an existing session and watch it.
    Follow { session: String },
    /// Open a share link as a follower, or start authoring without one.
    Open { link: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_client_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(public_url) = args.public_url {
        settings.public_url = Some(public_url);
    }
    let server_url = settings.server_url().context("invalid server url")?;
    let public_url = settings.public_url().context("invalid public url")?;

    let (address, role, initial_cards) = match args.command {
        Mode::Create { cards } => {
            let cards = cards
                .iter()
                .map(|raw| parse_card(raw))
                .collect::<Result<Vec<_>>>()?;
            (public_url, Role::Presenter, cards)
        }
        Mode::Present { session } => (linked(&public_url, &session)?, Role::Presenter, Vec::new()),
        Mode::Follow { session } => (linked(&public_url, &session)?, Role::Follower, Vec::new()),
        Mode::Open { link: Some(link) } => {
            (linked(&public_url, &link)?, Role::Follower, Vec::new())
        }
        Mode::Open { link: None } => (public_url, Role::Presenter, Vec::new()),
    };

    let collaborators = Collaborators {
        store: Arc::new(HttpRecordStore::new(server_url.clone())),
        feed: Arc::new(WsChangeFeed::new(server_url)),
        address: Arc::new(LinkAddressBar::new(address)),
        clipboard: Arc::new(SystemClipboard),
    };
    let launch_now = !initial_cards.is_empty();
    let controller = SessionController::spawn_with_state(
        collaborators,
        role,
        initial_view(initial_cards),
    );
    if launch_now {
        if let Err(err) = controller.apply(Action::Launch).await {
            println!("! {err}");
        }
    }

    let result = interact(&controller).await;
    controller.shutdown().await;
    result
}

/// `--card` values become drafts so that launching skips blank ones.
fn initial_view(cards: Vec<Card>) -> ViewState {
    if cards.is_empty() {
        ViewState::default()
    } else {
        ViewState::Authoring(Authoring::with_drafts(cards))
    }
}

fn linked(public_url: &Url, reference: &str) -> Result<Url> {
    let Some(session_id) = parse_session_reference(reference) else {
        bail!("{reference:?} is neither a session id nor a share link");
    };
    Ok(share_link(public_url, session_id))
}

async fn interact(controller: &SessionController) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut view = controller.view();
    let mut copied = controller.copied();
    let mut events = controller.subscribe_events();

    show(controller);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    return Ok(());
                };
                match parse_command(&line) {
                    Ok(Command::Act(action)) => {
                        if let Err(err) = controller.apply(action).await {
                            println!("! {err}");
                        }
                    }
                    Ok(Command::Show) => show(controller),
                    Ok(Command::Help) => println!("{HELP}"),
                    Ok(Command::Quit) => return Ok(()),
                    Err(err) => println!("! {err}"),
                }
            }
            changed = view.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                show(controller);
            }
            changed = copied.changed() => {
                if changed.is_ok() && *copied.borrow() {
                    println!("link copied");
                }
            }
            event = events.recv() => match event {
                Ok(event) => report(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "terminal: missed controller events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn show(controller: &SessionController) {
    let state: ViewState = controller.current();
    let copied = *controller.copied().borrow();
    println!("{}", render::render(&state, &controller.link(), copied));
}

fn report(event: ClientEvent) {
    match event {
        ClientEvent::AddressChanged(link) => println!("session published: {link}"),
        ClientEvent::SessionNotFound(id) => {
            println!("session {id} was not found, starting a new one instead")
        }
        ClientEvent::WriteFailed { message, .. } => println!("! update not saved: {message}"),
        ClientEvent::FeedClosed(id) => println!("! lost the change feed for {id}"),
        ClientEvent::Error(message) => println!("! {message}"),
        ClientEvent::ViewChanged | ClientEvent::Rejected(_) | ClientEvent::LinkCopied(_) => {}
    }
}
