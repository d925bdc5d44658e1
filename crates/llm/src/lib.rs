use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod client;
pub mod stream;

pub use client::OllamaCloudClient;
pub use stream::{AssembledTurn, Delta, Reassembler, UpstreamEvent, UpstreamLine, classify_line};

// ── Conversation model ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message of a conversation, shaped the way Ollama's `/api/chat`
/// accepts and returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Base64 image payloads (vision models only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    /// Name of the tool whose result this `tool` turn carries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatTurn {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thinking: None,
            tool_calls: None,
            images: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// A function call requested by the model inside an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            function: ToolFunction {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Arguments as an object.  Some models send the arguments as a JSON
    /// encoded string; those are decoded.  Anything else yields an empty map.
    pub fn arguments(&self) -> Map<String, Value> {
        match &self.function.arguments {
            Value::Object(map) => map.clone(),
            Value::String(raw) => serde_json::from_str::<Map<String, Value>>(raw).unwrap_or_default(),
            _ => Map::new(),
        }
    }
}

/// Body of one `POST /api/chat` call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            tools: None,
            options: None,
        }
    }

    pub fn with_tools(mut self, tools: Value) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Ollama API key not configured")]
    MissingApiKey,
    #[error("Ollama API error {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("failed to reach Ollama: {0}")]
    Transport(String),
    /// An `{"error": ...}` line inside an otherwise successful stream.
    #[error("Ollama stream error: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl LlmError {
    /// HTTP status a caller should answer with.  Upstream statuses are kept,
    /// transport failures map to 502.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingApiKey => 500,
            Self::Upstream { status, .. } => *status,
            Self::Transport(_) | Self::Stream(_) => 502,
        }
    }

    /// Human-facing explanation for the common upstream failures.
    pub fn user_message(&self, model: &str) -> String {
        match self {
            Self::Upstream { status: 401, .. } => {
                "Ollama rejected the API key; check OLLAMA_API_KEY.".to_string()
            }
            Self::Upstream { status: 404, .. } => {
                format!("Model \"{model}\" was not found; use a valid cloud model.")
            }
            Self::Upstream { status: 502, .. } => {
                "The model is unavailable or failing upstream; make sure the cloud model exists."
                    .to_string()
            }
            Self::Upstream { status, .. } => format!("Ollama API error: {status}"),
            other => other.to_string(),
        }
    }

    /// Raw upstream body, when there is one.
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::Upstream { body, .. } if !body.is_empty() => Some(body),
            _ => None,
        }
    }
}

// ── Backend seam ─────────────────────────────────────────────────────────────

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>;

/// Something that can run a streamed chat completion.  Implemented by
/// [`OllamaCloudClient`]; tests substitute scripted backends.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issue one chat call and hand back the raw NDJSON body.  A non-success
    /// status fails with [`LlmError::Upstream`]; nothing is retried.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, LlmError>;

    /// Models advertised by the host, as returned by `/api/tags`.
    async fn list_models(&self) -> Result<Vec<Value>, LlmError>;
}

// ── Tests ────────────────────────────────────────────────────────────────────
