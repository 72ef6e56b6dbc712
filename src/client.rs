//! Typed HTTP client for the backend's endpoints.
//!
//! The base URL is read from a [`watch::Receiver`] on every call, so a
//! restart that moves the backend (local port to external URL, or back)
//! is picked up by the next request without rebuilding the client.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Response, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::{AppError, Result};

/// Response header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "x-session-id";

/// Upper bound for every call except the stream itself.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatReply {
    /// Session the turn ran in.
    pub session_id: String,
    /// Full assistant reply.
    pub reply: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    session_id: Option<&'a str>,
}

/// Reply of `POST /reload-config`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReloadConfigReply {
    /// Server status string, `"reloaded"` on success.
    pub status: String,
    /// Model now in use.
    #[serde(default)]
    pub model: String,
    /// Provider base now in use.
    #[serde(default)]
    pub api_base: String,
}

/// Outcome of `POST /session/{id}/seal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SealOutcome {
    /// Whether the server kept the conversation reusable.
    pub preserved: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteReply {
    #[serde(default)]
    deleted: bool,
}

/// An open `GET /chat/stream` response.
#[derive(Debug)]
pub struct OpenStream {
    /// Session id from the response header, when present.
    pub session_id: Option<String>,
    /// Response whose body carries the event lines.
    pub response: Response,
}

/// HTTP client bound to the backend's current base URL.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: watch::Receiver<String>,
}

impl BackendClient {
    /// Client following the URL published on `base_url`.
    #[must_use]
    pub fn new(base_url: watch::Receiver<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Client for a URL that never changes.
    #[must_use]
    pub fn fixed(base_url: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), base_url)
    }

    /// Fixed-URL client sharing an existing connection pool.
    #[must_use]
    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let (_tx, base_url) = watch::channel(base_url.into());
        Self { http, base_url }
    }

    /// Base URL the next request will use.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url.borrow().trim_end_matches('/').to_owned()
    }

    fn url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}{path}", self.base_url());
        Url::parse(&raw).map_err(|e| AppError::Http(format!("invalid backend url {raw}: {e}")))
    }

    fn session_url(&self, session_id: &str, suffix: &[&str]) -> Result<Url> {
        let mut url = self.url("/session")?;
        url.path_segments_mut()
            .map_err(|()| AppError::Http("backend url cannot carry a path".into()))?
            .push(session_id)
            .extend(suffix);
        Ok(url)
    }

    /// `GET /health`; `true` on any 2xx.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` when the server cannot be reached.
    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .http
            .get(self.url("/health")?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    /// `POST /chat`: one non-streaming turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn chat(&self, message: &str, session_id: Option<&str>) -> Result<ChatReply> {
        let reply = self
            .http
            .post(self.url("/chat")?)
            .json(&ChatRequest {
                message,
                session_id,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    /// `GET /chat/stream`: open a streaming turn.
    ///
    /// No timeout applies; the stream runs until the server ends it or the
    /// caller drops the response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Stream` on transport failure or a non-2xx status.
    pub async fn open_stream(&self, message: &str, session_id: Option<&str>) -> Result<OpenStream> {
        let mut url = self.url("/chat/stream")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("message", message);
            if let Some(id) = session_id {
                query.append_pair("session_id", id);
            }
        }

        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| AppError::Stream(e.to_string()))?;

        let session_id = header_session_id(response.headers());
        debug!(session_id = session_id.as_deref(), "stream opened");
        Ok(OpenStream {
            session_id,
            response,
        })
    }

    /// `POST /reload-config` with refreshed settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigReload` on any failure.
    pub async fn reload_config(
        &self,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ReloadConfigReply> {
        let resp = self
            .http
            .post(self.url("/reload-config")?)
            .timeout(REQUEST_TIMEOUT)
            .json(payload)
            .send()
            .await
            .and_then(Response::error_for_status)
            .map_err(|e| AppError::ConfigReload(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| AppError::ConfigReload(format!("unexpected reply: {e}")))
    }

    /// `POST /reload`: rebuild the agent's internal wiring.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn reload_agent(&self) -> Result<()> {
        self.http
            .post(self.url("/reload")?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// `DELETE /session/{id}`. Returns whether the server deleted anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let reply: DeleteReply = self
            .http
            .delete(self.session_url(session_id, &[])?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.deleted)
    }

    /// `POST /session/{id}/seal`: close out an interrupted turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` on transport failure or a non-2xx status.
    pub async fn seal_session(&self, session_id: &str) -> Result<SealOutcome> {
        let outcome = self
            .http
            .post(self.session_url(session_id, &["seal"])?)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(outcome)
    }
}

fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}
