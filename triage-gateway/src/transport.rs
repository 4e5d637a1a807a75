use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Failure below the HTTP status level. Always worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Upstream request timed out")]
    Timeout,
    #[error("Failed to connect to upstream: {0}")]
    Connect(String),
    #[error("Upstream transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            TransportError::Timeout
        } else if value.is_connect() {
            TransportError::Connect(value.to_string())
        } else {
            TransportError::Other(value.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Body of an OpenAI-compatible chat-completions call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// A 200 chat completion whose assistant message is `content`.
    pub fn completion(content: &str) -> Self {
        let body = serde_json::json!({
            "id": "gen-scripted",
            "model": "scripted-model",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        });
        Self::new(200, body.to_string())
    }

    /// Adds a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }
}

/// One outbound call to the completion service.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn send(&self, request: &CompletionRequest) -> Result<UpstreamResponse, TransportError>;
}

/// reqwest-backed transport with bearer authentication.
pub struct HttpTransport {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn send(&self, request: &CompletionRequest) -> Result<UpstreamResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[derive(Debug, Clone)]
enum ScriptedReply {
    Response(UpstreamResponse),
    Failure(TransportError),
    Stall,
}

/// Transport double that replays canned replies in order and records when
/// each attempt happened.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    attempts: Mutex<Vec<Instant>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(self, response: UpstreamResponse) -> Self {
        self.push(ScriptedReply::Response(response))
    }

    pub fn push_status(self, status: u16, body: &str) -> Self {
        self.push_response(UpstreamResponse::new(status, body))
    }

    pub fn push_completion(self, content: &str) -> Self {
        self.push_response(UpstreamResponse::completion(content))
    }

    pub fn push_failure(self, error: TransportError) -> Self {
        self.push(ScriptedReply::Failure(error))
    }

    /// An attempt that never answers.
    pub fn push_stall(self) -> Self {
        self.push(ScriptedReply::Stall)
    }

    fn push(self, reply: ScriptedReply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
        self
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempt_times().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn send(&self, request: &CompletionRequest) -> Result<UpstreamResponse, TransportError> {
        let reply = {
            self.attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(Instant::now());
            self.requests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(request.clone());
            self.replies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
        };

        match reply {
            Some(ScriptedReply::Response(response)) => Ok(response),
            Some(ScriptedReply::Failure(error)) => Err(error),
            Some(ScriptedReply::Stall) => std::future::pending().await,
            None => Err(TransportError::Other("no scripted reply left".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "test-model".to_string(),
            temperature: 0.2,
            messages: vec![ChatMessage::system("be terse"), ChatMessage::user("hi")],
        }
    }

    #[tokio::test]
    async fn scripted_transport_replays_in_order() {
        let transport = ScriptedTransport::new()
            .push_status(503, "busy")
            .push_failure(TransportError::Timeout)
            .push_completion("{}");

        assert_eq!(transport.send(&request()).await.unwrap().status, 503);
        assert_eq!(
            transport.send(&request()).await.unwrap_err(),
            TransportError::Timeout
        );
        assert_eq!(transport.send(&request()).await.unwrap().status, 200);
        assert!(transport.send(&request()).await.is_err());
        assert_eq!(transport.attempts(), 4);
        assert_eq!(transport.requests()[0].model, "test-model");
    }

    #[test]
    fn completion_body_is_chat_shaped() {
        let response = UpstreamResponse::completion("{\"band\":\"low\"}");
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "{\"band\":\"low\"}"
        );
    }

    #[test]
    fn header_builder_skips_invalid_input() {
        let response = UpstreamResponse::new(429, "")
            .with_header("retry-after", "2")
            .with_header("bad header", "x");
        assert_eq!(response.headers.len(), 1);
        assert_eq!(response.headers["retry-after"], "2");
    }

    #[test]
    fn request_serializes_as_chat_completion() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
    }

    #[test]
    fn http_transport_trims_trailing_slash() {
        let transport = HttpTransport::new(
            "https://openrouter.ai/api/v1/chat/completions/",
            "key",
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(
            transport.endpoint(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }
}
