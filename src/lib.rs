//! Client core for the CareerGPT career-advice chat backend.
//!
//! - [`sse`] decodes the `text/event-stream` reply body into token / error /
//!   done events, independent of how the bytes were chunked.
//! - [`store`] holds the ordered transcript and broadcasts every change.
//! - [`optimistic`] shows user actions immediately and confirms or rolls
//!   them back once the server answers.
//! - [`controller`] drives one send-message turn through the backend, and
//!   [`bootstrap`] switches between the draft and saved sessions.
//! - [`api`] is the typed HTTP client; [`credentials`] supplies its token.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod message;
pub mod optimistic;
pub mod render;
pub mod resume;
pub mod sse;
pub mod store;

pub use api::ApiClient;
pub use bootstrap::BootstrapOutcome;
pub use config::ClientConfig;
pub use controller::{Canceller, StreamSessionController, StreamStatus, TurnOutcome};
pub use credentials::{CredentialProvider, FileCredentials, MemoryCredentials};
pub use error::{ChatError, StoreError, StreamFailure};
pub use message::{Message, MessageId, Role, Session, SessionId};
pub use sse::{FrameDecoder, StreamEvent};
pub use store::{TranscriptEvent, TranscriptStore};
