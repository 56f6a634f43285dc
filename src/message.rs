//! Transcript data model: messages, sessions and their identifiers.
//!
//! Server-assigned ids and client-generated ids never share a namespace:
//! [`MessageId::Server`] wraps the backend's integer primary key, while
//! [`MessageId::Local`] is minted by the optimistic message manager.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ChatError;

/// Sentinel used in routes and on the command line for a not-yet-created session.
pub const DRAFT_SENTINEL: &str = "new";

/// Default title the backend gives a session without a first message.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat Session";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of one message within a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    /// Primary key assigned by the backend.
    Server(i64),
    /// Client-generated id of a provisional message.
    Local(u64),
}

impl MessageId {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{id}"),
            MessageId::Local(id) => write!(f, "local-{id}"),
        }
    }
}

/// Identifier of a chat session: either the draft sentinel or a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionId {
    /// Not yet persisted; shown as `"new"`.
    #[default]
    Draft,
    Bound(u64),
}

impl SessionId {
    pub fn is_draft(&self) -> bool {
        matches!(self, SessionId::Draft)
    }

    /// The server id, if the session has been created.
    pub fn bound(&self) -> Option<u64> {
        match self {
            SessionId::Draft => None,
            SessionId::Bound(id) => Some(*id),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Draft => write!(f, "{DRAFT_SENTINEL}"),
            SessionId::Bound(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for SessionId {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(DRAFT_SENTINEL) {
            return Ok(SessionId::Draft);
        }
        s.parse::<u64>()
            .map(SessionId::Bound)
            .map_err(|_| ChatError::Validation(format!("invalid session id: '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Author of a message. The backend calls these `human` and `ai`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "human", alias = "user")]
    User,
    #[serde(rename = "ai", alias = "assistant")]
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "human"),
            Role::Assistant => write!(f, "ai"),
        }
    }
}

/// One entry in a transcript.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WireMessage")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    /// `None` while the message is provisional and not tied to a session.
    pub session_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A client-side message with a local id and no session.
    pub fn provisional(id: u64, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::Local(id),
            role,
            content: content.into(),
            session_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Message as the backend serializes it.
#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    session_id: Option<u64>,
    #[serde(default)]
    timestamp: Option<String>,
}

impl From<WireMessage> for Message {
    fn from(w: WireMessage) -> Self {
        Message {
            id: MessageId::Server(w.id),
            role: w.role,
            content: w.content,
            session_id: w.session_id,
            created_at: w
                .timestamp
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Parse an ISO-8601 timestamp. Naive timestamps (no offset) are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A full session object as returned by `POST /chat/`, `GET /chat/{id}` and
/// the résumé-analysis endpoints.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WireSession")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireSession {
    id: u64,
    #[serde(default = "default_title")]
    title: String,
    #[serde(default)]
    messages: Option<Vec<Message>>,
    #[serde(default)]
    created_at: Option<String>,
}

fn default_title() -> String {
    DEFAULT_SESSION_TITLE.to_string()
}

impl From<WireSession> for Session {
    fn from(w: WireSession) -> Self {
        Session {
            id: SessionId::Bound(w.id),
            title: w.title,
            messages: w.messages.unwrap_or_default(),
            created_at: w.created_at.as_deref().and_then(parse_timestamp),
        }
    }
}
