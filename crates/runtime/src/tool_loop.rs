//! Tool-call orchestration.
//!
//! One run drives the model through at most `max_iterations` upstream calls.
//! Each call's stream is forwarded to the client as it arrives; when the
//! assembled turn requests tools they are executed one after another in the
//! order received, their results appended as `tool` turns, and the model is
//! asked again.  Tool schemas are only offered while the iteration number is
//! within `tool_iterations`, which pushes the model towards a final answer.
//!
//! All run state (`LoopState`, `SourceUrls`) lives on the stack of one call.

use std::time::Instant;

use futures::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use fireflies_config::ToolsConfig;
use fireflies_llm::{
    AssembledTurn, ChatBackend, ChatRequest, ChatTurn, LlmError, Reassembler, ToolCall,
    UpstreamEvent,
};
use fireflies_tools::{ToolRegistry, ToolResult, json_args_to_string_map};

use crate::error::ChatError;
use crate::events::{EventEmitter, StreamEvent};

/// Error text emitted when the model still wants tools on the last call.
pub const ITERATION_LIMIT_MESSAGE: &str = "tool iteration limit reached before a final answer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_iterations: usize,
    pub tool_iterations: usize,
}

impl LoopLimits {
    pub fn from_config(config: &ToolsConfig) -> Self {
        let max_iterations = config.max_iterations.max(1);
        Self {
            max_iterations,
            tool_iterations: config.tool_iterations.min(max_iterations),
        }
    }

    /// Iterations are 1-based.
    pub fn offers_tools(&self, iteration: usize) -> bool {
        iteration <= self.tool_iterations
    }
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self::from_config(&ToolsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    #[default]
    AwaitingModel,
    ExecutingTools,
    Terminated,
}

/// Bookkeeping for one run, returned to the caller when it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopState {
    pub phase: LoopPhase,
    pub iteration: usize,
    pub gateway_calls: usize,
    pub tool_calls: usize,
    /// The model was still asking for tools when the cap was hit.
    pub hit_limit: bool,
}

/// Ordered, de-duplicated URLs cited at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceUrls {
    urls: Vec<String>,
}

impl SourceUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the URL was already present (or blank).
    pub fn insert(&mut self, url: impl Into<String>) -> bool {
        let url = url.into();
        let url = url.trim();
        if url.is_empty() || self.urls.iter().any(|u| u == url) {
            return false;
        }
        self.urls.push(url.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.urls.iter().map(String::as_str)
    }

    /// Trailing markdown block listing every source, or `None` when empty.
    pub fn citation_block(&self) -> Option<String> {
        if self.urls.is_empty() {
            return None;
        }
        let mut block = String::from("\n\n---\n\u{1F4DA} **Sources:**\n");
        for (i, url) in self.urls.iter().enumerate() {
            block.push_str(&format!("{}. {url}\n", i + 1));
        }
        Some(block)
    }
}

pub struct ToolLoop<'a> {
    backend: &'a dyn ChatBackend,
    tools: &'a ToolRegistry,
    limits: LoopLimits,
    model: String,
}

impl<'a> ToolLoop<'a> {
    pub fn new(
        backend: &'a dyn ChatBackend,
        tools: &'a ToolRegistry,
        limits: LoopLimits,
        model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            tools,
            limits,
            model: model.into(),
        }
    }

    /// Run the full tool loop over `conversation`.
    ///
    /// Returns `Err` only when nothing reached the client yet (the caller
    /// answers with a JSON error) or when the client went away.  Failures
    /// after output began are reported in-stream.
    pub async fn run(
        &self,
        mut conversation: Vec<ChatTurn>,
        mut sources: SourceUrls,
        emitter: &mut EventEmitter,
    ) -> Result<LoopState, ChatError> {
        let mut state = LoopState::default();
        let tools_json = self.tools.tools_json();

        loop {
            state.iteration += 1;
            state.phase = LoopPhase::AwaitingModel;
            let offer = !self.tools.is_empty() && self.limits.offers_tools(state.iteration);
            info!(
                iteration = state.iteration,
                offer_tools = offer,
                turns = conversation.len(),
                model = %self.model,
                "requesting model turn"
            );

            let mut request = ChatRequest::new(&self.model, std::mem::take(&mut conversation));
            if offer {
                request = request.with_tools(tools_json.clone());
            }
            state.gateway_calls += 1;
            let outcome = stream_turn(self.backend, &request, emitter).await;
            conversation = request.messages;

            let turn = match outcome {
                Ok(turn) => turn,
                Err(err) => {
                    self.fail(emitter, err).await?;
                    state.phase = LoopPhase::Terminated;
                    return Ok(state);
                }
            };

            if !turn.has_tool_calls() {
                finish(emitter, &sources).await?;
                state.phase = LoopPhase::Terminated;
                info!(
                    iterations = state.iteration,
                    tool_calls = state.tool_calls,
                    sources = sources.len(),
                    "tool loop finished"
                );
                return Ok(state);
            }

            if state.iteration >= self.limits.max_iterations {
                warn!(
                    iterations = state.iteration,
                    pending_calls = turn.tool_calls.len(),
                    "tool loop hit iteration limit"
                );
                if let Some(block) = sources.citation_block() {
                    emitter.emit(StreamEvent::content(block)).await?;
                }
                emitter.emit(StreamEvent::error(ITERATION_LIMIT_MESSAGE)).await?;
                emitter.emit(StreamEvent::Done).await?;
                state.hit_limit = true;
                state.phase = LoopPhase::Terminated;
                return Ok(state);
            }

            state.phase = LoopPhase::ExecutingTools;
            let calls = turn.tool_calls.clone();
            conversation.push(turn.into_turn());
            for call in &calls {
                let arguments = call.arguments();
                emitter
                    .emit(StreamEvent::ToolCall {
                        function: call.name().to_string(),
                        arguments: arguments.clone(),
                    })
                    .await?;
                let result = self.execute(call, &arguments, &mut sources, emitter).await?;
                state.tool_calls += 1;
                conversation.push(ChatTurn::tool(call.name(), result.to_content()));
            }
        }
    }

    /// One upstream call without tool schemas.  Tool calls the model emits
    /// anyway are ignored.
    pub async fn run_single(
        &self,
        conversation: Vec<ChatTurn>,
        options: Option<Value>,
        sources: SourceUrls,
        emitter: &mut EventEmitter,
    ) -> Result<LoopState, ChatError> {
        let mut request = ChatRequest::new(&self.model, conversation);
        if let Some(options) = options {
            request = request.with_options(options);
        }
        info!(model = %self.model, turns = request.messages.len(), "requesting single model turn");

        match stream_turn(self.backend, &request, emitter).await {
            Ok(turn) => {
                if turn.has_tool_calls() {
                    debug!(count = turn.tool_calls.len(), "ignoring tool calls on tool-less request");
                }
                finish(emitter, &sources).await?;
            }
            Err(err) => self.fail(emitter, err).await?,
        }

        Ok(LoopState {
            phase: LoopPhase::Terminated,
            iteration: 1,
            gateway_calls: 1,
            ..LoopState::default()
        })
    }

    async fn execute(
        &self,
        call: &ToolCall,
        arguments: &Map<String, Value>,
        sources: &mut SourceUrls,
        emitter: &EventEmitter,
    ) -> Result<ToolResult, ChatError> {
        let name = call.name();
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = name, "model requested unknown tool");
            return Ok(ToolResult::failure(format!("unknown tool: {name}")));
        };

        let args = json_args_to_string_map(arguments);
        if let Some(url) = tool.source_url(&args) {
            sources.insert(url);
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = emitter.closed() => return Err(ChatError::Disconnected),
            outcome = tool.run(&args) => outcome,
        };
        let result = outcome.unwrap_or_else(|err| {
            warn!(tool = name, error = %err, "tool execution failed");
            ToolResult::failure(err.to_string())
        });
        info!(
            tool = name,
            ok = result.ok,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool finished"
        );
        Ok(result)
    }

    /// Report a failure in-stream once output has begun; otherwise hand it
    /// back so the caller can answer with a status code.
    async fn fail(&self, emitter: &mut EventEmitter, err: ChatError) -> Result<(), ChatError> {
        match err {
            ChatError::Llm(err) if emitter.started() => {
                warn!(error = %err, "model call failed after output began");
                emitter
                    .emit(StreamEvent::error(err.user_message(&self.model)))
                    .await?;
                emitter.emit(StreamEvent::Done).await
            }
            other => Err(other),
        }
    }
}

async fn finish(emitter: &mut EventEmitter, sources: &SourceUrls) -> Result<(), ChatError> {
    if let Some(block) = sources.citation_block() {
        emitter.emit(StreamEvent::content(block)).await?;
    }
    emitter.emit(StreamEvent::Done).await
}

/// Issue one gateway call and forward its thinking and content events.
///
/// Stops reading at the first `done` line.  Gives up with
/// [`ChatError::Disconnected`] as soon as the client is gone, dropping the
/// upstream body.
async fn stream_turn(
    backend: &dyn ChatBackend,
    request: &ChatRequest,
    emitter: &mut EventEmitter,
) -> Result<AssembledTurn, ChatError> {
    let mut body = tokio::select! {
        _ = emitter.closed() => return Err(ChatError::Disconnected),
        body = backend.chat_stream(request) => body?,
    };

    let mut reassembler = Reassembler::new();
    let mut turn = AssembledTurn::default();
    loop {
        let chunk = tokio::select! {
            _ = emitter.closed() => {
                debug!("client disconnected while reading upstream");
                return Err(ChatError::Disconnected);
            }
            chunk = body.next() => chunk,
        };

        let (events, exhausted) = match chunk {
            Some(Ok(bytes)) => (reassembler.push(&bytes), false),
            Some(Err(err)) => return Err(err.into()),
            None => (reassembler.finish(), true),
        };

        for event in events {
            match &event {
                UpstreamEvent::Thinking(text) => {
                    emitter.emit(StreamEvent::thinking(text.clone())).await?
                }
                UpstreamEvent::Content(text) => {
                    emitter.emit(StreamEvent::content(text.clone())).await?
                }
                UpstreamEvent::Failure(message) => {
                    return Err(LlmError::Stream(message.clone()).into());
                }
                UpstreamEvent::ToolCalls(_) | UpstreamEvent::Done => {}
            }
            turn.absorb(&event);
            if turn.done {
                return Ok(turn);
            }
        }

        if exhausted {
            debug!("upstream stream ended without a done line");
            return Ok(turn);
        }
    }
}
