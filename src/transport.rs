//! Transport client — request/response calls against the session service.
//!
//! Stateless and retry-free: a failed call surfaces immediately and the
//! caller decides what to do with it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::model::{ChatRequest, ChatResponse, Message, Session};

/// The REST surface the synchronization engine depends on.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// `POST /api/sessions`: provision a new session.
    async fn create_session(&self) -> Result<Session, TransportError>;

    /// `GET /api/sessions/{id}`.
    async fn get_session(&self, session_id: &str) -> Result<Session, TransportError>;

    /// `GET /api/messages/{id}`: full ordered history. Empty is valid.
    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>, TransportError>;

    /// `POST /api/messages`: submit user text.
    ///
    /// Text that is empty after trimming is rejected without a request.
    async fn send_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<ChatResponse, TransportError>;
}

/// `SessionApi` over HTTP with reqwest.
pub struct RestClient {
    config: ClientConfig,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured reqwest client (proxies, timeouts, ...).
    pub fn with_client(config: ClientConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let resp = request
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(endpoint, error = %e, "Request failed");
                TransportError::Request {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(endpoint, status = status.as_u16(), body = %body, "Service returned an error");
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<T>().await.map_err(|e| {
            tracing::warn!(endpoint, error = %e, "Undecodable response body");
            TransportError::Decode {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

#[async_trait]
impl SessionApi for RestClient {
    async fn create_session(&self) -> Result<Session, TransportError> {
        let endpoint = "POST /api/sessions";
        let url = self.config.api_endpoint("/api/sessions");
        let session: Session = self.execute(endpoint, self.client.post(url)).await?;
        tracing::debug!(session_id = %session.id, step = %session.current_step, "Session created");
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, TransportError> {
        let endpoint = "GET /api/sessions/{id}";
        let url = self
            .config
            .api_endpoint(&format!("/api/sessions/{session_id}"));
        self.execute(endpoint, self.client.get(url)).await
    }

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<Message>, TransportError> {
        let endpoint = "GET /api/messages/{id}";
        let url = self
            .config
            .api_endpoint(&format!("/api/messages/{session_id}"));
        let messages: Vec<Message> = self.execute(endpoint, self.client.get(url)).await?;
        tracing::debug!(session_id, count = messages.len(), "History fetched");
        Ok(messages)
    }

    async fn send_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<ChatResponse, TransportError> {
        if text.trim().is_empty() {
            return Err(TransportError::EmptyMessage);
        }

        let endpoint = "POST /api/messages";
        let url = self.config.api_endpoint("/api/messages");
        let body = ChatRequest {
            session_id: session_id.to_string(),
            message: text.to_string(),
        };
        self.execute(endpoint, self.client.post(url).json(&body))
            .await
    }
}
