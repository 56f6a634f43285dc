//! Error taxonomy for the chat client.
//!
//! Transport and server failures are non-fatal to a session: the controller
//! turns them into an assistant-role message and the user can retry.
//! `Parse` never leaves the decoder and `Aborted` is never shown to the user.

use std::time::Duration;
use thiserror::Error;

use crate::message::MessageId;

/// Errors raised by [`TranscriptStore`](crate::store::TranscriptStore) mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `append` was given an id that is already present.
    #[error("duplicate message id {0}")]
    DuplicateId(MessageId),

    /// `patch_content` (or another targeted mutation) found no such message.
    #[error("message {0} not found")]
    NotFound(MessageId),

    /// Content was patched on a message that is not the open stream.
    #[error("message {0} is finalized, its content cannot change")]
    NotStreaming(MessageId),

    /// A second streaming message was opened while one is still open.
    #[error("message {open} is still streaming, cannot open {requested}")]
    StreamAlreadyOpen {
        open: MessageId,
        requested: MessageId,
    },
}

/// Why a streaming response ended with an error instead of `done`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    /// The server sent an explicit `error` frame.
    #[error("{0}")]
    Server(String),

    /// Reading the response body failed (connection lost).
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No bytes arrived within the configured idle timeout.
    #[error("no data received for {}s", .0.as_secs())]
    IdleTimeout(Duration),
}

/// Crate-wide error type.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChatError {
    /// The request never reached the server or the transport failed.
    #[error("network failure: {0}")]
    Network(String),

    /// The server replied with a non-2xx status.
    #[error("request failed ({status}): {detail}")]
    Http { status: u16, detail: String },

    /// The server rejected the bearer token (401). The stored credential has
    /// already been cleared when this is returned.
    #[error("Session expired. Please log in again.")]
    Unauthorized,

    /// An explicit error frame or a severed stream.
    #[error("stream error: {0}")]
    Stream(#[from] StreamFailure),

    /// One malformed frame or an unexpected response body.
    #[error("parse error: {0}")]
    Parse(String),

    /// The operation was cancelled on purpose.
    #[error("aborted")]
    Aborted,

    /// Client-side input rejected before any network call.
    #[error("{0}")]
    Validation(String),

    #[error("transcript: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ChatError {
    /// Whether this error should be shown to the user at all.
    pub fn is_visible(&self) -> bool {
        !matches!(self, ChatError::Aborted)
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChatError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            ChatError::Http {
                status: status.as_u16(),
                detail: err.to_string(),
            }
        } else {
            ChatError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Io(err.to_string())
    }
}
