use anyhow::{anyhow, bail, Context, Result};
use client_core::{Action, Direction};
use shared::domain::{Card, CardSide};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Act(Action),
    Show,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  n, next              next card
  p, prev              previous card
  f, flip              show the other side
  l, live              start or stop the live broadcast (presenter)
  a <front>=<back>     add a card
  c, copy              copy the share link
  q, quit              leave
while authoring:
  d [<front>=<back>]   add a draft
  e <n> front|back <text>
                       edit draft n
  launch               publish the drafts";

/// Parses `front=back`.
pub fn parse_card(raw: &str) -> Result<Card> {
    let (front, back) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected <front>=<back>, got {raw:?}"))?;
    Ok(Card::new(front.trim(), back.trim()))
}

pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word {
        "" => Command::Show,
        "n" | "next" => Command::Act(Action::Advance(Direction::Next)),
        "p" | "prev" | "previous" => Command::Act(Action::Advance(Direction::Previous)),
        "f" | "flip" => Command::Act(Action::ToggleReveal),
        "l" | "live" => Command::Act(Action::ToggleLive),
        "c" | "copy" => Command::Act(Action::CopyLink),
        "a" | "add" => Command::Act(Action::AddCard(parse_card(rest)?)),
        "d" | "draft" if rest.is_empty() => Command::Act(Action::AddDraft),
        "d" | "draft" => Command::Act(Action::AddCard(parse_card(rest)?)),
        "e" | "edit" => parse_edit(rest)?,
        "launch" => Command::Act(Action::Launch),
        "h" | "help" | "?" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        other => bail!("unknown command {other:?}, try help"),
    };
    Ok(command)
}

fn parse_edit(rest: &str) -> Result<Command> {
    let mut parts = rest.splitn(3, char::is_whitespace);
    let number: usize = parts
        .next()
        .filter(|raw| !raw.is_empty())
        .context("usage: e <n> front|back <text>")?
        .parse()
        .context("draft number must be a positive integer")?;
    let index = number
        .checked_sub(1)
        .context("draft numbers start at 1")?;
    let side = match parts.next() {
        Some("front") => CardSide::Front,
        Some("back") => CardSide::Back,
        _ => bail!("usage: e <n> front|back <text>"),
    };
    let text = parts.next().unwrap_or_default().trim().to_string();
    Ok(Command::Act(Action::EditDraft { index, side, text }))
}
