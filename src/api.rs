//! Typed HTTP client for the CareerGPT chat backend.
//!
//! Every request carries the bearer token from the injected
//! [`CredentialProvider`]. A 401 from any endpoint clears the stored token.

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::error::ChatError;
use crate::message::{Message, Session};
use crate::resume::{ResumeFile, RESUME_FORM_FIELD};

// -- Wire types -------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CreateSessionRequest<'a> {
    pub first_message: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SendMessageRequest<'a> {
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RenameSessionRequest<'a> {
    pub title: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredUser {
    pub id: u64,
    pub email: String,
}

/// FastAPI error body: `detail` is a string or a list of validation errors.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

// -- Client -----------------------------------------------------------------

pub struct ApiClient {
    config: ClientConfig,
    /// Non-streaming requests: bounded by `request_timeout`.
    client: Client,
    /// Streaming requests: connect timeout only; the idle timeout lives in the decoder.
    stream_client: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ChatError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("http client: {e}")))?;
        let stream_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("http client: {e}")))?;
        Ok(Self {
            config,
            client,
            stream_client,
            credentials,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    /// `GET /chat/`: every session of the logged-in user.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, ChatError> {
        let req = self.client.get(self.config.url("/chat/"));
        self.send_json(req).await
    }

    /// `POST /chat/`: create a session whose first turn is answered server-side.
    pub async fn create_session(&self, first_message: &str) -> Result<Session, ChatError> {
        let req = self
            .client
            .post(self.config.url("/chat/"))
            .json(&CreateSessionRequest { first_message });
        self.send_json(req).await
    }

    /// `GET /chat/{id}`: metadata and full transcript.
    pub async fn get_session(&self, id: u64) -> Result<Session, ChatError> {
        let req = self.client.get(self.config.url(&format!("/chat/{id}")));
        self.send_json(req).await
    }

    /// `PUT /chat/{id}`: rename.
    pub async fn rename_session(&self, id: u64, title: &str) -> Result<Session, ChatError> {
        let req = self
            .client
            .put(self.config.url(&format!("/chat/{id}")))
            .json(&RenameSessionRequest { title });
        self.send_json(req).await
    }

    /// `DELETE /chat/{id}`.
    pub async fn delete_session(&self, id: u64) -> Result<(), ChatError> {
        let req = self.client.delete(self.config.url(&format!("/chat/{id}")));
        self.send(req).await.map(|_| ())
    }

    /// `POST /chat/{id}/messages/stream`: returns the response once its
    /// status has been checked; the body is an SSE stream.
    pub async fn open_stream(&self, id: u64, content: &str) -> Result<Response, ChatError> {
        let req = self
            .stream_client
            .post(self.config.url(&format!("/chat/{id}/messages/stream")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&SendMessageRequest { content });
        self.send(req).await
    }

    /// `POST /chat/resume-analysis`: create a session from a résumé.
    pub async fn upload_resume_new(&self, file: &ResumeFile) -> Result<Session, ChatError> {
        let req = self
            .client
            .post(self.config.url("/chat/resume-analysis"))
            .multipart(resume_form(file)?);
        self.send_json(req).await
    }

    /// `POST /chat/{id}/resume-analysis`: add an analysis to a session.
    /// Returns the analysis message when the server sends one.
    pub async fn upload_resume_to(&self, id: u64, file: &ResumeFile) -> Result<Option<Message>, ChatError> {
        let req = self
            .client
            .post(self.config.url(&format!("/chat/{id}/resume-analysis")))
            .multipart(resume_form(file)?);
        self.send_json(req).await
    }

    /// `POST /auth/token`: exchange credentials for a bearer token and store it.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, ChatError> {
        let req = self
            .client
            .post(self.config.url("/auth/token"))
            .form(&[("username", email), ("password", password)]);
        let token: TokenResponse = self.send_json(req).await?;
        self.credentials.set(&token.access_token)?;
        debug!(token_type = ?token.token_type, "logged in");
        Ok(token.access_token)
    }

    /// `POST /auth/register`.
    pub async fn register(&self, email: &str, password: &str) -> Result<RegisteredUser, ChatError> {
        let req = self
            .client
            .post(self.config.url("/auth/register"))
            .json(&RegisterRequest { email, password });
        self.send_json(req).await
    }

    pub fn logout(&self) -> Result<(), ChatError> {
        self.credentials.clear()
    }

    // -- internals ----------------------------------------------------------

    async fn send_json<T>(&self, req: RequestBuilder) -> Result<T, ChatError>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self.send(req).await?;
        let bytes = resp.bytes().await.map_err(|e| ChatError::Network(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(ChatError::from)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ChatError> {
        let req = match self.credentials.get() {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let resp = req.send().await.map_err(|e| {
            warn!(error = %e, "request failed before a response arrived");
            ChatError::Network(e.to_string())
        })?;
        self.check_status(resp).await
    }

    async fn check_status(&self, resp: Response) -> Result<Response, ChatError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        if status == StatusCode::UNAUTHORIZED {
            warn!(%url, "token rejected, clearing stored credential");
            if let Err(e) = self.credentials.clear() {
                warn!(error = %e, "could not clear stored credential");
            }
            return Err(ChatError::Unauthorized);
        }

        let body = resp.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody { detail: serde_json::Value::String(s) }) => s,
            Ok(ErrorBody { detail }) => detail.to_string(),
            Err(_) if body.trim().is_empty() => status
                .canonical_reason()
                .unwrap_or("An error occurred")
                .to_string(),
            Err(_) => body,
        };
        warn!(status = status.as_u16(), %url, %detail, "request rejected");
        Err(ChatError::Http {
            status: status.as_u16(),
            detail,
        })
    }
}

fn resume_form(file: &ResumeFile) -> Result<reqwest::multipart::Form, ChatError> {
    let part = reqwest::multipart::Part::bytes(file.bytes.clone())
        .file_name(file.name.clone())
        .mime_str(file.content_type())
        .map_err(|e| ChatError::Validation(format!("invalid content type: {e}")))?;
    Ok(reqwest::multipart::Form::new().part(RESUME_FORM_FIELD, part))
}
