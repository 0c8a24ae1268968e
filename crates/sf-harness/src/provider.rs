//! LLM provider abstraction.
//!
//! A unified async trait for chat completion against the configured
//! provider, plus concrete Anthropic/OpenAI implementations and a mock for
//! testing. Providers are selected per run from `LlmSettings.provider`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sf_core::types::LlmSettings;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when calling an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP-level failure (connection, DNS, TLS).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success status with a message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to parse the response body.
    #[error("parse error: {0}")]
    Parse(String),

    /// HTTP 429 from the provider.
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// No provider implementation exists for the requested name.
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

/// Classification of agent call failures used by retry and error routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    RateLimit,
    Provider5xx,
    Network,
    Unknown,
}

impl FailureKind {
    /// Transient kinds are retried with exponential backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimit | FailureKind::Provider5xx | FailureKind::Network
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Validation => "validation_error",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Provider5xx => "provider_5xx",
            FailureKind::Network => "network",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Map a provider error to its failure kind.
pub fn classify(err: &LlmError) -> FailureKind {
    match err {
        LlmError::RateLimited { .. } => FailureKind::RateLimit,
        LlmError::Api { status, .. } if *status >= 500 => FailureKind::Provider5xx,
        LlmError::Http(_) | LlmError::Timeout => FailureKind::Network,
        LlmError::Parse(_) => FailureKind::Validation,
        LlmError::Api { .. } | LlmError::NotConfigured(_) => FailureKind::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::System => write!(f, "system"),
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }
}

/// One completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON-shaped response where supported.
    pub json_mode: bool,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 4096,
            temperature: 0.7,
            json_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

// ---------------------------------------------------------------------------
// LlmClient trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError>;

    /// Human-readable provider name (e.g. "anthropic", "openai").
    fn name(&self) -> &str;
}

/// Build the provider named in the run's LLM settings.
pub fn client_for(settings: &LlmSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
    match settings.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(settings.api_key.clone()))),
        "openai" => Ok(Arc::new(OpenAiProvider::new(settings.api_key.clone()))),
        other => Err(LlmError::NotConfigured(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for the Anthropic Messages API.
    ///
    /// System messages are folded into the top-level `system` field. The
    /// API has no JSON response mode; `json_mode` requests append a system
    /// directive instead.
    pub fn build_request_body(messages: &[LlmMessage], request: &LlmRequest) -> serde_json::Value {
        let mut system_text: Option<String> = None;

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                if msg.role == LlmRole::System {
                    if let Some(ref mut s) = system_text {
                        s.push('\n');
                        s.push_str(&msg.content);
                    } else {
                        system_text = Some(msg.content.clone());
                    }
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role.to_string(),
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        if request.json_mode {
            let directive = "Respond with a single valid JSON document and nothing else.";
            match system_text {
                Some(ref mut s) => {
                    s.push('\n');
                    s.push_str(directive);
                }
                None => system_text = Some(directive.to_string()),
            }
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": api_messages,
        });

        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }

        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    _type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmClient for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, request);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api_resp: AnthropicResponse =
            resp.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            usage: TokenUsage {
                input_tokens: api_resp.usage.input_tokens,
                output_tokens: api_resp.usage.output_tokens,
            },
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// Provider for the OpenAI Chat Completions API.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing or Azure OpenAI).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for the Chat Completions API.
    pub fn build_request_body(messages: &[LlmMessage], request: &LlmRequest) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.to_string(),
                    "content": msg.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": api_messages,
        });

        if request.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        body
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    model: String,
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageResp,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessageResp {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for OpenAiProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let api_resp: OpenAiResponse =
            resp.json().await.map_err(|e| LlmError::Parse(e.to_string()))?;

        let choice = api_resp
            .choices
            .first()
            .ok_or_else(|| LlmError::Parse("no choices in response".into()))?;

        Ok(LlmResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            model: api_resp.model,
            usage: TokenUsage {
                input_tokens: api_resp.usage.prompt_tokens,
                output_tokens: api_resp.usage.completion_tokens,
            },
            finish_reason: choice
                .finish_reason
                .clone()
                .unwrap_or_else(|| "unknown".into()),
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A mock client for testing.
///
/// Responses resolve in three tiers: a prompt-content route (first
/// matching substring wins; each route yields its queued responses in
/// order and then repeats the last one), then the global FIFO queue, then
/// a default response. Routes keep concurrent callers (e.g. fire-and-forget
/// evaluations) from draining responses scripted for the main path.
/// Requests are captured for assertions.
#[derive(Clone)]
pub struct MockProvider {
    routes: Arc<Mutex<Vec<MockRoute>>>,
    responses: Arc<Mutex<VecDeque<Result<LlmResponse, LlmError>>>>,
    #[allow(clippy::type_complexity)]
    captured_requests: Arc<Mutex<Vec<(Vec<LlmMessage>, LlmRequest)>>>,
}

struct MockRoute {
    pattern: String,
    responses: VecDeque<LlmResponse>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Route prompts containing `pattern` to `content`, repeatedly.
    pub fn route(&self, pattern: impl Into<String>, content: impl Into<String>) {
        self.route_sequence(pattern, vec![content.into()]);
    }

    /// Route prompts containing `pattern` through `contents` in order; the
    /// final entry repeats once the sequence is exhausted.
    pub fn route_sequence(&self, pattern: impl Into<String>, contents: Vec<String>) {
        let responses = contents
            .into_iter()
            .map(|content| LlmResponse {
                content,
                model: "mock".to_string(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                finish_reason: "end_turn".to_string(),
            })
            .collect();
        self.routes
            .lock()
            .expect("MockProvider lock poisoned")
            .push(MockRoute {
                pattern: pattern.into(),
                responses,
            });
    }

    fn routed_response(&self, prompt: &str) -> Option<LlmResponse> {
        let mut routes = self.routes.lock().expect("MockProvider lock poisoned");
        for route in routes.iter_mut() {
            if prompt.contains(route.pattern.as_str()) {
                return if route.responses.len() > 1 {
                    route.responses.pop_front()
                } else {
                    route.responses.front().cloned()
                };
            }
        }
        None
    }

    /// Queue a successful response with the given content.
    pub fn push_content(&self, content: impl Into<String>) {
        self.push_response(LlmResponse {
            content: content.into(),
            model: "mock".to_string(),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            finish_reason: "end_turn".to_string(),
        });
    }

    pub fn push_response(&self, response: LlmResponse) {
        self.responses
            .lock()
            .expect("MockProvider lock poisoned")
            .push_back(Ok(response));
    }

    pub fn push_error(&self, error: LlmError) {
        self.responses
            .lock()
            .expect("MockProvider lock poisoned")
            .push_back(Err(error));
    }

    /// Builder-style variant of [`push_content`].
    pub fn with_content(self, content: impl Into<String>) -> Self {
        self.push_content(content);
        self
    }

    pub fn captured_requests(&self) -> Vec<(Vec<LlmMessage>, LlmRequest)> {
        self.captured_requests
            .lock()
            .expect("MockProvider lock poisoned")
            .clone()
    }

    fn default_response(model: &str) -> LlmResponse {
        LlmResponse {
            content: "Mock response".to_string(),
            model: model.to_string(),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            finish_reason: "end_turn".to_string(),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for MockProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        self.captured_requests
            .lock()
            .expect("MockProvider lock poisoned")
            .push((messages.to_vec(), request.clone()));

        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(response) = self.routed_response(&prompt) {
            return Ok(response);
        }

        let mut queue = self.responses.lock().expect("MockProvider lock poisoned");
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(Self::default_response(&request.model)),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
