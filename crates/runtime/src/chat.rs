//! `/chat` request decoding and dispatch to the orchestrator.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use fireflies_config::AppConfig;
use fireflies_llm::{ChatBackend, ChatTurn, Role};
use fireflies_tools::ToolRegistry;

use crate::error::{ApiError, ChatError};
use crate::events::EventEmitter;
use crate::prompt_builder::{ContextSource, PromptInputs, build_system_turn};
use crate::tool_loop::{LoopLimits, LoopState, SourceUrls, ToolLoop};

/// Inbound `/chat` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub use_tools: bool,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Base64 image, optionally as a `data:` URL.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub search_context: Vec<ContextSource>,
    #[serde(default)]
    pub web_context: Option<ContextSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    /// One upstream call, no tools.
    Plain,
    /// The full tool loop.
    Tools,
    /// One call to the vision model with the image attached.
    Vision,
}

/// A validated request, ready to run.
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub model: String,
    pub mode: ChatMode,
    pub stream: bool,
    pub conversation: Vec<ChatTurn>,
    pub options: Option<Value>,
    pub sources: SourceUrls,
}

impl ChatBody {
    /// Validate the body and build the conversation the model will see.
    pub fn prepare(self, config: &AppConfig, tools: &ToolRegistry) -> Result<PreparedChat, ApiError> {
        let prompt = self
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        if prompt.is_none() && self.messages.is_empty() {
            return Err(ApiError::bad_request("Prompt is required"));
        }
        let stream = self.stream.unwrap_or(true);

        let mut history = self.messages;
        if let Some(prompt) = &prompt {
            let repeated = history
                .last()
                .is_some_and(|t| t.role == Role::User && t.content.trim() == prompt.as_str());
            if !repeated {
                history.push(ChatTurn::user(prompt.clone()));
            }
        }

        if let Some(image) = self.image.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
            let Some(last_user) = history.iter_mut().rev().find(|t| t.role == Role::User) else {
                return Err(ApiError::bad_request("Prompt is required for image requests"));
            };
            last_user.images = Some(vec![strip_data_url(image).to_string()]);
            return Ok(PreparedChat {
                model: config.llm.cloud_model(Some(config.llm.vision_model.as_str())),
                mode: ChatMode::Vision,
                stream,
                conversation: history,
                options: Some(json!({"temperature": 0.1, "top_p": 0.9})),
                sources: SourceUrls::new(),
            });
        }

        let mode = if self.use_tools && !tools.is_empty() {
            ChatMode::Tools
        } else {
            ChatMode::Plain
        };

        let context: Vec<ContextSource> = self
            .search_context
            .into_iter()
            .chain(self.web_context)
            .collect();
        let mut sources = SourceUrls::new();
        for source in context.iter().filter(|s| !s.content.trim().is_empty()) {
            sources.insert(source.url.clone());
        }

        let specs = if mode == ChatMode::Tools { tools.list_specs() } else { Vec::new() };
        let system = build_system_turn(&PromptInputs {
            system_prompt: &config.llm.system_prompt,
            tool_specs: &specs,
            sources: &context,
            source_char_cap: config.fetch.page_char_cap,
        });
        let mut conversation = Vec::with_capacity(history.len() + 1);
        conversation.push(system);
        conversation.extend(history);

        Ok(PreparedChat {
            model: config.llm.cloud_model(self.model.as_deref()),
            mode,
            stream,
            conversation,
            options: None,
            sources,
        })
    }
}

/// `data:image/png;base64,AAAA` → `AAAA`; bare base64 passes through.
pub fn strip_data_url(image: &str) -> &str {
    match image.split_once(',') {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => image,
    }
}

/// Shared, read-only dependencies of a chat run.
#[derive(Clone)]
pub struct ChatSession {
    pub backend: Arc<dyn ChatBackend>,
    pub tools: Arc<ToolRegistry>,
    pub limits: LoopLimits,
}

impl ChatSession {
    pub async fn run(
        &self,
        prepared: PreparedChat,
        emitter: &mut EventEmitter,
    ) -> Result<LoopState, ChatError> {
        debug!(model = %prepared.model, mode = ?prepared.mode, "starting chat run");
        let looper = ToolLoop::new(
            self.backend.as_ref(),
            self.tools.as_ref(),
            self.limits,
            prepared.model,
        );
        match prepared.mode {
            ChatMode::Tools => {
                looper
                    .run(prepared.conversation, prepared.sources, emitter)
                    .await
            }
            ChatMode::Plain | ChatMode::Vision => {
                looper
                    .run_single(
                        prepared.conversation,
                        prepared.options,
                        prepared.sources,
                        emitter,
                    )
                    .await
            }
        }
    }
}
