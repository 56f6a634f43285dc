//! Optimistic message manager.
//!
//! Provisional messages are appended before the server answers and handed
//! back as a [`Provisional`] handle. The handle is not `Clone` and is consumed
//! by exactly one of [`OptimisticMessages::confirm`] or one of the rollback
//! methods, so a caller cannot settle the same message twice.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ChatError, StoreError};
use crate::message::{Message, MessageId, Role};
use crate::resume::ResumeFile;
use crate::store::TranscriptStore;

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time-based local id source. Ids are strictly increasing even when two
/// are requested within the same millisecond.
#[derive(Debug, Default)]
pub struct LocalIds {
    last: u64,
}

impl LocalIds {
    pub fn next_id(&mut self) -> u64 {
        let id = now_ms().max(self.last.saturating_add(1));
        self.last = id;
        id
    }
}

/// Handle to a provisional message awaiting confirmation or rollback.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a provisional message must be confirmed or rolled back"]
pub struct Provisional {
    id: MessageId,
}

impl Provisional {
    pub fn id(&self) -> MessageId {
        self.id
    }
}

/// Creates provisional entries and reconciles them with the server outcome.
#[derive(Debug, Default)]
pub struct OptimisticMessages {
    ids: LocalIds,
}

impl OptimisticMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh local message id.
    pub fn next_id(&mut self) -> MessageId {
        MessageId::Local(self.ids.next_id())
    }

    /// Append a provisional user message carrying `text`.
    pub fn send_user_message(
        &mut self,
        store: &mut TranscriptStore,
        text: &str,
    ) -> Result<Provisional, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message is empty".to_string()));
        }
        self.push(store, Role::User, text.to_string())
    }

    /// Validate `file` and append a provisional "analyzing" status message.
    ///
    /// An invalid file is rejected before the transcript is touched.
    pub fn upload_file(
        &mut self,
        store: &mut TranscriptStore,
        file: &ResumeFile,
    ) -> Result<Provisional, ChatError> {
        file.validate()?;
        self.push(store, Role::User, analyzing_text(&file.name))
    }

    /// Append an empty assistant message to receive stream patches.
    pub fn assistant_placeholder(
        &mut self,
        store: &mut TranscriptStore,
        session_id: Option<u64>,
    ) -> Result<MessageId, StoreError> {
        self.assistant_message(store, session_id, String::new())
    }

    /// Append a finalized assistant message, e.g. a user-visible error reply.
    pub fn assistant_message(
        &mut self,
        store: &mut TranscriptStore,
        session_id: Option<u64>,
        content: String,
    ) -> Result<MessageId, StoreError> {
        let mut msg = Message::provisional(self.ids.next_id(), Role::Assistant, content);
        msg.session_id = session_id;
        let id = msg.id;
        store.append(msg)?;
        Ok(id)
    }

    /// The server accepted the message. If it is still in the transcript
    /// (i.e. not replaced by a full session reload) it is stamped with the
    /// session it now belongs to.
    pub fn confirm(&self, store: &mut TranscriptStore, handle: Provisional, session_id: Option<u64>) {
        if let Some(sid) = session_id {
            // Absent means the server transcript already replaced it.
            let _ = store.assign_session(handle.id, sid);
        }
    }

    /// Remove the provisional message. Safe if it is already gone.
    pub fn rollback(&self, store: &mut TranscriptStore, handle: Provisional) {
        store.remove(handle.id);
    }

    /// Remove the provisional message and append an assistant-role error reply.
    pub fn rollback_with_error(
        &mut self,
        store: &mut TranscriptStore,
        handle: Provisional,
        session_id: Option<u64>,
        error_text: &str,
    ) -> Result<MessageId, StoreError> {
        self.rollback(store, handle);
        self.assistant_message(store, session_id, error_text.to_string())
    }

    fn push(
        &mut self,
        store: &mut TranscriptStore,
        role: Role,
        content: String,
    ) -> Result<Provisional, ChatError> {
        let msg = Message::provisional(self.ids.next_id(), role, content);
        let id = msg.id;
        store.append(msg)?;
        Ok(Provisional { id })
    }
}

/// Status line shown while a résumé is being analysed.
pub fn analyzing_text(file_name: &str) -> String {
    format!("📄 Analyzing uploaded resume: {file_name}...")
}
