//! Chat-completion providers.
//!
//! [`OpenAiClient`] talks to any OpenAI-compatible `/chat/completions`
//! endpoint. [`ScriptedProvider`] answers from a closure and backs offline
//! runs and tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::json::parse_json_response;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("provider returned no choices")]
    Empty,
    #[error("malformed model output: {0}")]
    Malformed(String),
}

// ── Messages ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// A user message carrying text followed by images (`data:` URIs or URLs).
    pub fn user_with_images(text: impl Into<String>, images: &[String]) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(images.iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.clone() },
        }));
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// Plain text of the message, ignoring image parts.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn append_text(&mut self, extra: &str) {
        match &mut self.content {
            MessageContent::Text(t) => t.push_str(extra),
            MessageContent::Parts(parts) => parts.push(ContentPart::Text {
                text: extra.to_string(),
            }),
        }
    }
}

// ── Requests ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    JsonObject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.3,
            max_tokens: 4096,
            response_format: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn json(mut self) -> Self {
        self.response_format = Some(ResponseFormat::JsonObject);
        self
    }

    /// Text of the last user message, or empty.
    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(ChatMessage::text)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: String,
}

/// Calls and tokens spent on a piece of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub calls: i64,
    pub tokens: i64,
}

impl Usage {
    pub fn add(&mut self, response: &ChatResponse) {
        self.calls += 1;
        self.tokens += response.total_tokens as i64;
    }

    pub fn merge(&mut self, other: Usage) {
        self.calls += other.calls;
        self.tokens += other.tokens;
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, InferenceError>;
}

const JSON_ONLY: &str = "\n\nRespond with valid JSON only, no other text.";

/// Request a JSON answer and parse it.
///
/// Asks for `response_format = json_object` first. If the provider rejects the
/// request, retries once without it and with a JSON-only instruction appended
/// to the last user message. Unparseable content yields the
/// `{"raw": ..., "_parse_error": true}` sentinel rather than an error.
pub async fn chat_json(
    provider: &dyn ChatProvider,
    request: ChatRequest,
) -> Result<(serde_json::Value, ChatResponse), InferenceError> {
    let request = request.json();
    let first = provider.chat(&request).await;
    let response = match first {
        Ok(r) => r,
        Err(InferenceError::Server { status, body }) => {
            debug!(status, body = %body, "JSON mode rejected, retrying as plain chat");
            let mut plain = request;
            plain.response_format = None;
            if let Some(last) = plain.messages.last_mut()
                && last.role == Role::User
            {
                last.append_text(JSON_ONLY);
            }
            provider.chat(&plain).await?
        }
        Err(e) => return Err(e),
    };
    let parsed = parse_json_response(&response.content);
    Ok((parsed, response))
}

// ── OpenAI-compatible HTTP client ──

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    /// `base_url` should be like `https://api.siliconflow.cn/v1` (no trailing slash needed).
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn into_response(body: CompletionResponse, model: &str) -> Result<ChatResponse, InferenceError> {
    let choice = body.choices.into_iter().next().ok_or(InferenceError::Empty)?;
    let usage = body.usage.unwrap_or_default();
    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        finish_reason: choice.finish_reason,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        model: model.to_string(),
    })
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, InferenceError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            json = request.response_format.is_some(),
            "chat completion"
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Server {
                status: status.as_u16(),
                body,
            });
        }
        let body: CompletionResponse = resp.json().await?;
        let response = into_response(body, &request.model)?;
        debug!(
            model = %request.model,
            tokens = response.total_tokens,
            finish = response.finish_reason.as_deref().unwrap_or(""),
            "chat completion done"
        );
        Ok(response)
    }
}

// ── Scripted provider ──

type Responder = dyn Fn(&ChatRequest) -> Result<String, InferenceError> + Send + Sync;

/// Provider whose answers come from a closure. Every call reports ten tokens.
pub struct ScriptedProvider {
    respond: Box<Responder>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(
        respond: impl Fn(&ChatRequest) -> Result<String, InferenceError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with the same content.
    pub fn constant(content: impl Into<String>) -> Self {
        let content = content.into();
        Self::new(move |_| Ok(content.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let content = (self.respond)(request)?;
        Ok(ChatResponse {
            content,
            finish_reason: Some("stop".into()),
            prompt_tokens: 6,
            completion_tokens: 4,
            total_tokens: 10,
            model: request.model.clone(),
        })
    }
}
