use std::fmt::Write;

use client_core::{Authoring, SessionView, ViewState};
use shared::domain::CardSide;

pub fn render(state: &ViewState, link: &str, copied: bool) -> String {
    match state {
        ViewState::Authoring(authoring) => render_authoring(authoring),
        ViewState::Presenting(view) => render_session("presenting", view, link, copied),
        ViewState::Following(view) => render_session("following", view, link, copied),
    }
}

fn render_authoring(authoring: &Authoring) -> String {
    let mut out = String::from("new session\n");
    for (i, draft) in authoring.drafts.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {}. {} | {}{}",
            i + 1,
            draft.front,
            draft.back,
            if draft.is_blank() { "  (skipped)" } else { "" }
        );
    }
    if authoring.create_pending {
        out.push_str("creating session...\n");
    } else {
        out.push_str("type `launch` to publish, `help` for commands\n");
    }
    out
}

fn render_session(role: &str, view: &SessionView, link: &str, copied: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{role} [{}] card {}/{}",
        if view.is_live() { "LIVE" } else { "not live" },
        view.current_index() + 1,
        view.cards().len()
    );
    let side = view.visible_side();
    let label = match side {
        CardSide::Front => "front",
        CardSide::Back => "back",
    };
    if let Some(card) = view.current_card() {
        let _ = writeln!(out, "  {label}: {}", card.side(side));
    }
    let _ = writeln!(out, "link: {link}{}", if copied { "  (copied)" } else { "" });
    out
}
