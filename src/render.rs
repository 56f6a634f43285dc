//! Terminal rendering of transcript change events.
//!
//! The printer is append-only: streamed tokens are written as deltas on the
//! open line, everything else as whole lines.

use colored::*;
use std::io::{self, Write};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::message::{Message, MessageId, Role, Session};
use crate::store::TranscriptEvent;

struct Shown {
    id: MessageId,
    role: Role,
    content: String,
}

pub struct TranscriptPrinter<W: Write> {
    out: W,
    color: bool,
    /// Message currently receiving streamed text.
    live: Option<MessageId>,
    shown: Vec<Shown>,
}

impl<W: Write> TranscriptPrinter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self {
            out,
            color,
            live: None,
            shown: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn handle(&mut self, event: &TranscriptEvent) -> io::Result<()> {
        match event {
            TranscriptEvent::Appended(msg) => {
                if !msg.content.is_empty() {
                    self.write_message(msg.role, &msg.content)?;
                }
                self.shown.push(Shown {
                    id: msg.id,
                    role: msg.role,
                    content: msg.content.clone(),
                });
            }
            TranscriptEvent::StreamOpened(id) => {
                let role = self.role_of(*id).unwrap_or(Role::Assistant);
                let label = self.label(role);
                write!(self.out, "{label} ")?;
                self.live = Some(*id);
            }
            TranscriptEvent::Patched { id, content } => {
                let previous = self.shown.iter().position(|s| s.id == *id);
                if self.live == Some(*id) {
                    let before = previous.map(|i| self.shown[i].content.as_str()).unwrap_or("");
                    match content.strip_prefix(before) {
                        Some(delta) => write!(self.out, "{delta}")?,
                        None => write!(self.out, "\n{content}")?,
                    }
                } else {
                    let role = previous.map(|i| self.shown[i].role).unwrap_or(Role::Assistant);
                    self.write_message(role, content)?;
                }
                if let Some(i) = previous {
                    self.shown[i].content = content.clone();
                }
            }
            TranscriptEvent::StreamClosed(id) => {
                if self.live == Some(*id) {
                    writeln!(self.out)?;
                    self.live = None;
                }
            }
            TranscriptEvent::Removed(id) => {
                if let Some(i) = self.shown.iter().position(|s| s.id == *id) {
                    let gone = self.shown.remove(i);
                    if !gone.content.is_empty() || gone.role == Role::Assistant {
                        let note = "  (withdrawn)";
                        if self.color {
                            writeln!(self.out, "{}", note.dimmed())?;
                        } else {
                            writeln!(self.out, "{note}")?;
                        }
                    }
                }
            }
            TranscriptEvent::Replaced(messages) => self.replace(messages)?,
        }
        self.out.flush()
    }

    /// Print every message not already on screen, then adopt `messages` as
    /// the displayed transcript.
    fn replace(&mut self, messages: &[Message]) -> io::Result<()> {
        if self.live.take().is_some() {
            writeln!(self.out)?;
        }
        for msg in messages {
            let seen = self
                .shown
                .iter()
                .position(|s| s.role == msg.role && s.content == msg.content);
            match seen {
                Some(i) => {
                    self.shown.remove(i);
                }
                None if msg.content.is_empty() => {}
                None => self.write_message(msg.role, &msg.content)?,
            }
        }
        self.shown = messages
            .iter()
            .map(|m| Shown {
                id: m.id,
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        Ok(())
    }

    /// Drain `rx` until the store is dropped.
    pub async fn run(mut self, mut rx: broadcast::Receiver<TranscriptEvent>) -> W {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.handle(&event) {
                        warn!(error = %e, "transcript output failed");
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "renderer fell behind, some updates were skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.out
    }

    fn role_of(&self, id: MessageId) -> Option<Role> {
        self.shown.iter().find(|s| s.id == id).map(|s| s.role)
    }

    fn write_message(&mut self, role: Role, content: &str) -> io::Result<()> {
        let label = self.label(role);
        writeln!(self.out, "{label} {content}")
    }

    fn label(&self, role: Role) -> String {
        let text = match role {
            Role::User => "you>",
            Role::Assistant => "careergpt>",
        };
        match (self.color, role) {
            (false, _) => text.to_string(),
            (true, Role::User) => text.bright_green().bold().to_string(),
            (true, Role::Assistant) => text.bright_cyan().bold().to_string(),
        }
    }
}

/// One line per session: id, creation date, title.
pub fn write_session_list<W: Write>(out: &mut W, sessions: &[Session], color: bool) -> io::Result<()> {
    if sessions.is_empty() {
        return writeln!(out, "No chat sessions yet.");
    }
    for session in sessions {
        let id = session.id.to_string();
        let created = session
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        if color {
            writeln!(out, "{:>6}  {}  {}", id.bright_yellow(), created.dimmed(), session.title)?;
        } else {
            writeln!(out, "{id:>6}  {created}  {}", session.title)?;
        }
    }
    Ok(())
}
