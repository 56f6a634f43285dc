//! Entering a session: the draft sentinel or an existing server session.

use tracing::{info, warn};

use crate::controller::StreamSessionController;
use crate::error::ChatError;
use crate::message::SessionId;

/// Result of [`StreamSessionController::enter_session`].
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapOutcome {
    /// Empty transcript, waiting for the first message.
    Draft,
    Loaded { id: u64, messages: usize },
    /// The requested session could not be loaded; a fresh draft is shown instead.
    Redirected { requested: u64, error: ChatError },
}

impl BootstrapOutcome {
    /// The session the controller ended up on.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Loaded { id, .. } => SessionId::Bound(*id),
            Self::Draft | Self::Redirected { .. } => SessionId::Draft,
        }
    }
}

impl StreamSessionController {
    /// Switch to `target`.
    ///
    /// Any in-flight turn is cancelled first so no stale patch can land in the
    /// new transcript. Loading an unknown or forbidden session never fails:
    /// the controller falls back to a draft and reports the redirect.
    pub async fn enter_session(&mut self, target: SessionId) -> BootstrapOutcome {
        self.cancel();
        match target {
            SessionId::Draft => {
                self.reset_draft();
                BootstrapOutcome::Draft
            }
            SessionId::Bound(id) => match self.api().get_session(id).await {
                Ok(session) => {
                    let messages = session.messages.len();
                    self.reset_draft();
                    self.apply_session(session);
                    info!(session_id = id, messages, "session loaded");
                    BootstrapOutcome::Loaded { id, messages }
                }
                Err(error) => {
                    warn!(session_id = id, error = %error, "session load failed, starting a new chat");
                    self.reset_draft();
                    BootstrapOutcome::Redirected { requested: id, error }
                }
            },
        }
    }
}
