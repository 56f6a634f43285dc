//! Stream session controller: one send-message (or résumé upload) turn at a time.
//!
//! ## State machine
//! ```text
//! draft session:  Idle -> AwaitingResponse -> Idle            (POST /chat/, full session back)
//! bound session:  Idle -> AwaitingResponse -> Streaming -> Finalizing -> Idle
//! ```
//! - The controller owns [`StreamStatus`] and mutates the transcript only
//!   through append / patch / remove, except for `replace_all` when a full
//!   session object arrives.
//! - Every provisional message is either confirmed or rolled back before the
//!   turn returns. A turn future dropped mid-flight is settled by the next
//!   operation (last write wins): its provisional message is removed, its
//!   placeholder keeps whatever text streamed in and is closed.
//! - Transport and stream failures never escape as `Err`; they become an
//!   assistant-role message plus [`TurnOutcome::Failed`]. `Err` is reserved
//!   for input rejected before anything was sent.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::error::{ChatError, StreamFailure};
use crate::message::{Message, MessageId, Session, SessionId};
use crate::optimistic::{OptimisticMessages, Provisional};
use crate::resume::ResumeFile;
use crate::sse::{EventStream, StreamEvent};
use crate::store::{ContentPatch, TranscriptEvent, TranscriptStore};

/// Reply shown when a turn fails before any assistant text arrived.
pub const SEND_FAILED_TEXT: &str = "Sorry, an error occurred. Please try again.";
/// Reply shown when a stream is severed or times out.
pub const STREAM_FAILED_TEXT: &str =
    "Sorry, there was an error processing your request. Please try again.";
/// Reply shown when a résumé analysis upload fails.
pub const UPLOAD_FAILED_TEXT: &str = "Sorry, the resume analysis failed. Please try again.";

/// Where the current operation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    AwaitingResponse,
    /// `placeholder` is the assistant message receiving tokens.
    Streaming { placeholder: MessageId },
    Finalizing,
}

/// How a turn settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed,
    /// Cancelled on purpose; nothing is shown as an error.
    Cancelled,
    /// The failure has already been written to the transcript.
    Failed(ChatError),
}

/// Cloneable handle that aborts the in-flight operation from another task.
#[derive(Debug, Clone, Default)]
pub struct Canceller {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl Canceller {
    /// Cancel the current operation. Returns `false` if nothing was in flight.
    pub fn cancel(&self) -> bool {
        match self.slot.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(token) if !token.is_cancelled() => {
                    token.cancel();
                    true
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    fn install(&self, token: CancellationToken) {
        if let Ok(mut guard) = self.slot.lock() {
            if let Some(previous) = guard.replace(token) {
                previous.cancel();
            }
        }
    }

    fn take(&self) -> Option<CancellationToken> {
        self.slot.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// Identity of the session shown in the transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSession {
    pub id: SessionId,
    pub title: Option<String>,
}

impl ActiveSession {
    /// Draft -> bound. Happens once per draft and never reverts.
    fn bind(&mut self, id: u64, title: String) -> Result<(), ChatError> {
        match self.id {
            SessionId::Draft => {
                self.id = SessionId::Bound(id);
                self.title = Some(title);
                Ok(())
            }
            SessionId::Bound(current) => Err(ChatError::Validation(format!(
                "session {current} is already bound, cannot bind {id}"
            ))),
        }
    }
}

pub struct StreamSessionController {
    api: ApiClient,
    store: TranscriptStore,
    optimistic: OptimisticMessages,
    session: ActiveSession,
    status: StreamStatus,
    /// Provisional message of the operation in flight, until it is settled.
    in_flight: Option<MessageId>,
    canceller: Canceller,
}

impl StreamSessionController {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            store: TranscriptStore::new(),
            optimistic: OptimisticMessages::new(),
            session: ActiveSession::default(),
            status: StreamStatus::Idle,
            in_flight: None,
            canceller: Canceller::default(),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &TranscriptStore {
        &self.store
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TranscriptEvent> {
        self.store.subscribe()
    }

    pub fn session(&self) -> &ActiveSession {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Set if and only if the status is `Streaming`.
    pub fn placeholder_message_id(&self) -> Option<MessageId> {
        match self.status {
            StreamStatus::Streaming { placeholder } => Some(placeholder),
            _ => None,
        }
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Abort whatever is in flight and settle its state.
    ///
    /// Partial assistant text that already streamed in is kept.
    pub fn cancel(&mut self) {
        if let Some(token) = self.canceller.take() {
            token.cancel();
        }
        self.settle_interrupted();
    }

    // -----------------------------------------------------------------------
    // Send message
    // -----------------------------------------------------------------------

    /// Send `text` as the next user turn.
    ///
    /// A draft session is created with `text` as its first message
    /// (non-streaming); a bound session streams the reply token by token.
    pub async fn send_message(&mut self, text: &str) -> Result<TurnOutcome, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("message is empty".to_string()));
        }
        let cancel = self.begin_operation();
        let handle = self.optimistic.send_user_message(&mut self.store, text)?;
        self.in_flight = Some(handle.id());
        self.set_status(StreamStatus::AwaitingResponse);

        let result = match self.session.id {
            SessionId::Draft => self.create_with_first_message(handle, text, &cancel).await,
            SessionId::Bound(id) => self.continue_session(id, handle, text, &cancel).await,
        };
        self.finish_operation(result)
    }

    async fn create_with_first_message(
        &mut self,
        handle: Provisional,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Aborted),
            r = self.api.create_session(text) => r,
        };
        match response {
            Ok(session) => {
                let id = self.adopt_new_session(session)?;
                self.optimistic.confirm(&mut self.store, handle, Some(id));
                info!(session_id = id, "session created");
                Ok(TurnOutcome::Completed)
            }
            Err(e) => self.fail_provisional(handle, None, e, SEND_FAILED_TEXT),
        }
    }

    async fn continue_session(
        &mut self,
        session_id: u64,
        handle: Provisional,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        // The idle limit also covers the wait for response headers.
        let idle = self.api.config().idle_timeout;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Aborted),
            r = tokio::time::timeout(idle, self.api.open_stream(session_id, text)) => {
                r.unwrap_or(Err(ChatError::Stream(StreamFailure::IdleTimeout(idle))))
            }
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => return self.fail_provisional(handle, Some(session_id), e, SEND_FAILED_TEXT),
        };

        self.optimistic.confirm(&mut self.store, handle, Some(session_id));
        self.in_flight = None;

        let placeholder = self
            .optimistic
            .assistant_placeholder(&mut self.store, Some(session_id))?;
        self.store.open_stream(placeholder)?;
        self.set_status(StreamStatus::Streaming { placeholder });

        let mut events = EventStream::new(response.bytes_stream(), cancel.clone())
            .with_idle_timeout(self.api.config().idle_timeout);

        loop {
            match events.next().await {
                Some(StreamEvent::Token(token)) => {
                    self.store
                        .patch_content(placeholder, ContentPatch::Append(token))?;
                }
                Some(StreamEvent::Done) => {
                    self.finalize(placeholder);
                    return Ok(TurnOutcome::Completed);
                }
                Some(StreamEvent::Error(failure)) => {
                    let text = match &failure {
                        StreamFailure::Server(msg) => format!("Error: {msg}"),
                        StreamFailure::ConnectionLost(_) | StreamFailure::IdleTimeout(_) => {
                            STREAM_FAILED_TEXT.to_string()
                        }
                    };
                    warn!(session_id, error = %failure, "stream failed");
                    self.store
                        .patch_content(placeholder, ContentPatch::Replace(text))?;
                    self.finalize(placeholder);
                    return Ok(TurnOutcome::Failed(ChatError::Stream(failure)));
                }
                None if events.was_cancelled() => {
                    self.close_partial(placeholder);
                    return Ok(TurnOutcome::Cancelled);
                }
                None => {
                    debug!(session_id, "stream ended without done frame");
                    self.finalize(placeholder);
                    return Ok(TurnOutcome::Completed);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Résumé upload
    // -----------------------------------------------------------------------

    /// Upload a résumé for analysis. Invalid file types are rejected with
    /// `ChatError::Validation` before the transcript or network is touched.
    pub async fn upload_file(&mut self, file: &ResumeFile) -> Result<TurnOutcome, ChatError> {
        file.validate()?;
        let cancel = self.begin_operation();
        let handle = self.optimistic.upload_file(&mut self.store, file)?;
        self.in_flight = Some(handle.id());
        self.set_status(StreamStatus::AwaitingResponse);

        let result = match self.session.id {
            SessionId::Draft => self.upload_to_new_session(handle, file, &cancel).await,
            SessionId::Bound(id) => self.upload_to_session(id, handle, file, &cancel).await,
        };
        self.finish_operation(result)
    }

    async fn upload_to_new_session(
        &mut self,
        handle: Provisional,
        file: &ResumeFile,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Aborted),
            r = self.api.upload_resume_new(file) => r,
        };
        match response {
            Ok(session) => {
                let id = self.adopt_new_session(session)?;
                self.optimistic.confirm(&mut self.store, handle, Some(id));
                info!(session_id = id, file = %file.name, "session created from resume");
                Ok(TurnOutcome::Completed)
            }
            Err(e) => self.fail_provisional(handle, None, e, UPLOAD_FAILED_TEXT),
        }
    }

    /// The analysis is applied by re-fetching the session, so the transcript
    /// shows exactly what the server persisted.
    async fn upload_to_session(
        &mut self,
        session_id: u64,
        handle: Provisional,
        file: &ResumeFile,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        let uploaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Aborted),
            r = self.api.upload_resume_to(session_id, file) => r,
        };
        let analysis = match uploaded {
            Ok(analysis) => analysis,
            Err(e) => return self.fail_provisional(handle, Some(session_id), e, UPLOAD_FAILED_TEXT),
        };

        let refreshed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Aborted),
            r = self.api.get_session(session_id) => r,
        };
        match refreshed {
            Ok(session) => {
                self.session.title = Some(session.title);
                self.store.replace_all(session.messages);
                self.optimistic.confirm(&mut self.store, handle, Some(session_id));
                Ok(TurnOutcome::Completed)
            }
            Err(e) => {
                let cancelled = e == ChatError::Aborted;
                if !cancelled {
                    warn!(session_id, error = %e, "refresh after resume upload failed");
                }
                match analysis {
                    // The upload is persisted; show its analysis in place of the provisional.
                    Some(message) => {
                        self.optimistic.rollback(&mut self.store, handle);
                        self.in_flight = None;
                        if let Err(dup) = self.store.append(message) {
                            debug!(error = %dup, "analysis already present");
                        }
                        Ok(if cancelled {
                            TurnOutcome::Cancelled
                        } else {
                            TurnOutcome::Completed
                        })
                    }
                    None => self.fail_provisional(handle, Some(session_id), e, UPLOAD_FAILED_TEXT),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Session management
    // -----------------------------------------------------------------------

    /// Rename the bound session.
    pub async fn rename(&mut self, title: &str) -> Result<(), ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::Validation("title is empty".to_string()));
        }
        let id = self
            .session
            .id
            .bound()
            .ok_or_else(|| ChatError::Validation("a new chat has no title yet".to_string()))?;
        let session = self.api.rename_session(id, title).await?;
        self.session.title = Some(session.title);
        Ok(())
    }

    /// Delete the bound session and fall back to a fresh draft.
    pub async fn delete_current(&mut self) -> Result<(), ChatError> {
        let id = self
            .session
            .id
            .bound()
            .ok_or_else(|| ChatError::Validation("nothing to delete".to_string()))?;
        self.cancel();
        self.api.delete_session(id).await?;
        self.reset_draft();
        Ok(())
    }

    /// Show `session` as the active one (navigation, not creation).
    pub(crate) fn apply_session(&mut self, session: Session) {
        self.session = ActiveSession {
            id: session.id,
            title: Some(session.title),
        };
        self.store.replace_all(session.messages);
    }

    /// Empty transcript, draft sentinel, no metadata.
    pub(crate) fn reset_draft(&mut self) {
        self.session = ActiveSession::default();
        self.store.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Settle anything left over and install a fresh cancellation token.
    fn begin_operation(&mut self) -> CancellationToken {
        if self.status != StreamStatus::Idle || self.in_flight.is_some() {
            debug!(status = ?self.status, "superseding interrupted operation");
        }
        if let Some(previous) = self.canceller.take() {
            previous.cancel();
        }
        self.settle_interrupted();
        let token = CancellationToken::new();
        self.canceller.install(token.clone());
        token
    }

    fn finish_operation(&mut self, result: Result<TurnOutcome, ChatError>) -> Result<TurnOutcome, ChatError> {
        self.canceller.take();
        if result.is_err() {
            // Internal transcript error: do not leave anything dangling.
            self.settle_interrupted();
        }
        self.in_flight = None;
        self.set_status(StreamStatus::Idle);
        result
    }

    /// Bring state left behind by a dropped or failed operation back to idle.
    fn settle_interrupted(&mut self) {
        if let Some(id) = self.in_flight.take() {
            self.store.remove(id);
        }
        if let StreamStatus::Streaming { placeholder } = self.status {
            self.close_partial(placeholder);
        }
        if self.store.streaming_id().is_some() {
            self.store.close_stream();
        }
        self.set_status(StreamStatus::Idle);
    }

    fn adopt_new_session(&mut self, session: Session) -> Result<u64, ChatError> {
        let id = session
            .id
            .bound()
            .ok_or_else(|| ChatError::Parse("server returned a session without an id".to_string()))?;
        self.session.bind(id, session.title)?;
        self.store.replace_all(session.messages);
        Ok(id)
    }

    fn fail_provisional(
        &mut self,
        handle: Provisional,
        session_id: Option<u64>,
        error: ChatError,
        reply: &str,
    ) -> Result<TurnOutcome, ChatError> {
        self.in_flight = None;
        if error == ChatError::Aborted {
            self.optimistic.rollback(&mut self.store, handle);
            return Ok(TurnOutcome::Cancelled);
        }
        warn!(session = %self.session.id, error = %error, "turn failed, rolling back");
        self.optimistic
            .rollback_with_error(&mut self.store, handle, session_id, reply)?;
        Ok(TurnOutcome::Failed(error))
    }

    fn finalize(&mut self, placeholder: MessageId) {
        self.set_status(StreamStatus::Finalizing);
        if self.store.streaming_id() == Some(placeholder) {
            self.store.close_stream();
        }
        self.set_status(StreamStatus::Idle);
    }

    /// Close a cancelled placeholder, keeping its text. An empty one is removed.
    fn close_partial(&mut self, placeholder: MessageId) {
        self.finalize(placeholder);
        let empty = self
            .store
            .get(placeholder)
            .is_some_and(|m| m.content.is_empty());
        if empty {
            self.store.remove(placeholder);
        }
    }

    fn set_status(&mut self, status: StreamStatus) {
        if self.status != status {
            debug!(from = ?self.status, to = ?status, "stream status");
            self.status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::credentials::MemoryCredentials;

    fn controller() -> StreamSessionController {
        // Port 9 (discard) on loopback: nothing in these tests reaches the network.
        let api = ApiClient::new(
            ClientConfig::new("http://127.0.0.1:9"),
            Arc::new(MemoryCredentials::new()),
        )
        .unwrap();
        StreamSessionController::new(api)
    }

    #[test]
    fn test_starts_idle_in_draft() {
        let c = controller();
        assert_eq!(c.status(), StreamStatus::Idle);
        assert_eq!(c.session_id(), SessionId::Draft);
        assert_eq!(c.placeholder_message_id(), None);
        assert!(c.messages().is_empty());
    }

    #[test]
    fn test_bind_is_one_way() {
        let mut s = ActiveSession::default();
        s.bind(4, "t".into()).unwrap();
        assert_eq!(s.id, SessionId::Bound(4));
        assert!(s.bind(5, "u".into()).is_err());
        assert_eq!(s.id, SessionId::Bound(4));
    }

    #[test]
    fn test_canceller_without_operation() {
        let c = controller();
        assert!(!c.canceller().cancel());
    }

    #[tokio::test]
    async fn test_blank_message_rejected_without_mutation() {
        let mut c = controller();
        let err = c.send_message("  ").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(c.messages().is_empty());
        assert_eq!(c.status(), StreamStatus::Idle);
    }

    #[tokio::test]
    async fn test_invalid_upload_rejected_without_mutation() {
        let mut c = controller();
        let file = ResumeFile::new("holiday.jpg", Some("image/jpeg".into()), vec![0xff]);
        let err = c.upload_file(&file).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(c.messages().is_empty());
    }

    #[test]
    fn test_cancel_keeps_partial_text_and_closes_stream() {
        let mut c = controller();
        c.session.id = SessionId::Bound(1);
        let id = c.optimistic.assistant_placeholder(&mut c.store, Some(1)).unwrap();
        c.store.open_stream(id).unwrap();
        c.store
            .patch_content(id, ContentPatch::Append("partial".into()))
            .unwrap();
        c.status = StreamStatus::Streaming { placeholder: id };

        c.cancel();

        assert_eq!(c.status(), StreamStatus::Idle);
        assert_eq!(c.store().streaming_id(), None);
        assert_eq!(c.store().get(id).unwrap().content, "partial");
    }

    #[test]
    fn test_settle_removes_orphaned_provisional() {
        let mut c = controller();
        let h = c.optimistic.send_user_message(&mut c.store, "hi").unwrap();
        c.in_flight = Some(h.id());
        c.status = StreamStatus::AwaitingResponse;
        c.optimistic.confirm(&mut c.store, h, None);

        c.cancel();

        assert!(c.messages().is_empty());
        assert_eq!(c.status(), StreamStatus::Idle);
    }

    #[test]
    fn test_reset_draft_clears_everything() {
        let mut c = controller();
        c.apply_session(Session {
            id: SessionId::Bound(3),
            title: "t".into(),
            messages: vec![Message::provisional(1, crate::message::Role::User, "x")],
            created_at: None,
        });
        assert_eq!(c.session_id(), SessionId::Bound(3));
        c.reset_draft();
        assert_eq!(c.session(), &ActiveSession::default());
        assert!(c.messages().is_empty());
    }
}
