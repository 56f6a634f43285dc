//! Transcript store: the ordered message list of the active session.
//!
//! ## Design
//! - The store exclusively owns the `Vec<Message>`; every mutation goes
//!   through `append` / `patch_content` / `remove` / `replace_all`.
//! - Every mutation is announced on a `tokio::sync::broadcast` channel so any
//!   number of renderers can re-draw from it. Sending never blocks; a slow
//!   subscriber sees `Lagged` and should re-read [`TranscriptStore::messages`].
//! - At most one message is open for streaming at a time. The open id is
//!   tracked here so renderers can tell growing content from finalized content.
//! - Content is immutable once finalized: only the open streaming message
//!   accepts patches.

use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::message::{Message, MessageId};

/// Capacity of the change-notification channel.
pub const TRANSCRIPT_CHANNEL_CAP: usize = 1024;

/// A change notification emitted after every successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Appended(Message),
    /// Content of `id` changed; `content` is the full new text.
    Patched { id: MessageId, content: String },
    Removed(MessageId),
    Replaced(Vec<Message>),
    /// `id` started receiving stream patches.
    StreamOpened(MessageId),
    /// `id` stopped receiving stream patches; its content is final.
    StreamClosed(MessageId),
}

/// How `patch_content` changes a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPatch {
    Replace(String),
    Append(String),
}

/// Ordered, id-unique message list with change notification.
pub struct TranscriptStore {
    messages: Vec<Message>,
    streaming: Option<MessageId>,
    tx: broadcast::Sender<TranscriptEvent>,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(TRANSCRIPT_CHANNEL_CAP);
        Self {
            messages: Vec::new(),
            streaming: None,
            tx,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.tx.subscribe()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.get(id).is_some()
    }

    /// The message currently receiving stream patches, if any.
    pub fn streaming_id(&self) -> Option<MessageId> {
        self.streaming
    }

    /// Insert `message` at the end. Never overwrites an existing id.
    pub fn append(&mut self, message: Message) -> Result<(), StoreError> {
        if self.contains(message.id) {
            return Err(StoreError::DuplicateId(message.id));
        }
        self.messages.push(message.clone());
        self.notify(TranscriptEvent::Appended(message));
        Ok(())
    }

    /// Replace or extend the content of `id`. Only `content` is touched.
    pub fn patch_content(&mut self, id: MessageId, patch: ContentPatch) -> Result<(), StoreError> {
        self.update_content(id, |content| match patch {
            ContentPatch::Replace(text) => *content = text,
            ContentPatch::Append(text) => content.push_str(&text),
        })
    }

    /// Apply an updater closure to the content of `id`, which must be the
    /// open streaming message.
    pub fn update_content<F>(&mut self, id: MessageId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut String),
    {
        if self.streaming != Some(id) {
            return Err(if self.contains(id) {
                StoreError::NotStreaming(id)
            } else {
                StoreError::NotFound(id)
            });
        }
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound(id))?;
        f(&mut msg.content);
        let content = msg.content.clone();
        self.notify(TranscriptEvent::Patched { id, content });
        Ok(())
    }

    /// Stamp a confirmed provisional message with its session id.
    pub fn assign_session(&mut self, id: MessageId, session_id: u64) -> Result<(), StoreError> {
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::NotFound(id))?;
        msg.session_id = Some(session_id);
        Ok(())
    }

    /// Delete `id`. Removing an absent id is a silent no-op.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&mut self, id: MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        if self.messages.len() == before {
            return false;
        }
        if self.streaming == Some(id) {
            self.streaming = None;
            self.notify(TranscriptEvent::StreamClosed(id));
        }
        self.notify(TranscriptEvent::Removed(id));
        true
    }

    /// Wholesale reset, used on bootstrap and on full-session responses.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        if let Some(open) = self.streaming.take() {
            self.notify(TranscriptEvent::StreamClosed(open));
        }
        self.messages = messages;
        self.notify(TranscriptEvent::Replaced(self.messages.clone()));
    }

    pub fn clear(&mut self) {
        self.replace_all(Vec::new());
    }

    /// Mark `id` as the open streaming message.
    pub fn open_stream(&mut self, id: MessageId) -> Result<(), StoreError> {
        if !self.contains(id) {
            return Err(StoreError::NotFound(id));
        }
        match self.streaming {
            Some(open) if open != id => Err(StoreError::StreamAlreadyOpen { open, requested: id }),
            Some(_) => Ok(()),
            None => {
                self.streaming = Some(id);
                self.notify(TranscriptEvent::StreamOpened(id));
                Ok(())
            }
        }
    }

    /// Finalize the open streaming message, if any.
    pub fn close_stream(&mut self) -> Option<MessageId> {
        let closed = self.streaming.take()?;
        self.notify(TranscriptEvent::StreamClosed(closed));
        Some(closed)
    }

    fn notify(&self, event: TranscriptEvent) {
        // No receivers is fine: nobody is rendering.
        let _ = self.tx.send(event);
    }
}
