//! Client side of a live flashcard session.
//!
//! [`reconciler`] holds the pure state machine. [`controller`] drives it
//! against a [`store::RecordStore`], a [`store::ChangeFeed`], an address bar
//! and a clipboard. [`http`] talks to the flashlive service and [`memory`]
//! keeps everything in process.

pub mod address;
pub mod clipboard;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod memory;
pub mod reconciler;
pub mod store;

pub use address::{parse_session_reference, share_link, AddressBar, LinkAddressBar};
pub use clipboard::{Clipboard, CopyIndicator, MemoryClipboard};
pub use config::{load_client_settings, ClientSettings};
pub use controller::{ClientEvent, Collaborators, SessionController};
pub use error::ClientError;
pub use http::{HttpRecordStore, WsChangeFeed};
pub use memory::InMemoryBackend;
pub use reconciler::{
    reconcile, Action, Authoring, Direction, Effect, Input, ReconcileError, Role, SessionView,
    Transition, ViewState,
};
pub use store::{ChangeFeed, RecordStore, Subscription};
