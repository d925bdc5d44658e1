//! Incremental decoding of Ollama's newline-delimited JSON chat stream.
//!
//! Bytes are buffered until a `\n` arrives and only complete lines are
//! decoded, so multi-byte characters split across network chunks never reach
//! the UTF-8 decoder half-finished.  Every decoded line is classified into an
//! [`UpstreamLine`] before anything acts on it.

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use crate::{ChatTurn, Role, ToolCall};

/// The closed set of shapes an upstream line can take.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamLine {
    Delta(Delta),
    Failure(String),
    KeepAlive,
}

/// The usable parts of one streamed chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub thinking: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub done: bool,
}

/// Normalized events, in the order they must be forwarded.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Thinking(String),
    Content(String),
    ToolCalls(Vec<ToolCall>),
    Failure(String),
    /// The upstream turn finished.  Ends the sub-stream, not the response.
    Done,
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

/// Classify one line.  Returns `None` for blank or unparseable lines, which
/// callers drop.
pub fn classify_line(line: &str) -> Option<UpstreamLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawLine = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(err) => {
            trace!(error = %err, line, "dropping unparseable upstream line");
            return None;
        }
    };

    if let Some(error) = raw.error {
        let message = match error {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Some(UpstreamLine::Failure(message));
    }

    let (thinking, content, tool_calls) = match raw.message {
        Some(msg) => (
            msg.thinking.unwrap_or_default(),
            msg.content.unwrap_or_default(),
            msg.tool_calls.unwrap_or_default(),
        ),
        None => Default::default(),
    };

    if thinking.is_empty() && content.is_empty() && tool_calls.is_empty() && !raw.done {
        return Some(UpstreamLine::KeepAlive);
    }

    Some(UpstreamLine::Delta(Delta {
        thinking,
        content,
        tool_calls,
        done: raw.done,
    }))
}

impl Delta {
    fn into_events(self, out: &mut Vec<UpstreamEvent>) {
        if !self.thinking.is_empty() {
            out.push(UpstreamEvent::Thinking(self.thinking));
        }
        if !self.content.is_empty() {
            out.push(UpstreamEvent::Content(self.content));
        }
        if !self.tool_calls.is_empty() {
            out.push(UpstreamEvent::ToolCalls(self.tool_calls));
        }
        if self.done {
            out.push(UpstreamEvent::Done);
        }
    }
}

/// Splits a chunked byte stream into lines and turns them into events.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and collect the events of every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<UpstreamEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            Self::decode(&line[..line.len() - 1], &mut events);
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<UpstreamEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            Self::decode(&line, &mut events);
        }
        events
    }

    fn decode(line: &[u8], out: &mut Vec<UpstreamEvent>) {
        let text = String::from_utf8_lossy(line);
        match classify_line(&text) {
            Some(UpstreamLine::Delta(delta)) => delta.into_events(out),
            Some(UpstreamLine::Failure(message)) => out.push(UpstreamEvent::Failure(message)),
            Some(UpstreamLine::KeepAlive) | None => {}
        }
    }
}

/// Accumulates the events of one upstream turn into an assistant message.
#[derive(Debug, Clone, Default)]
pub struct AssembledTurn {
    pub thinking: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub done: bool,
}

impl AssembledTurn {
    pub fn absorb(&mut self, event: &UpstreamEvent) {
        match event {
            UpstreamEvent::Thinking(text) => self.thinking.push_str(text),
            UpstreamEvent::Content(text) => self.content.push_str(text),
            UpstreamEvent::ToolCalls(calls) => self.tool_calls.extend(calls.iter().cloned()),
            UpstreamEvent::Done => self.done = true,
            UpstreamEvent::Failure(_) => {}
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The assistant turn to append to the conversation history.
    pub fn into_turn(self) -> ChatTurn {
        ChatTurn {
            role: Role::Assistant,
            content: self.content,
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            tool_calls: (!self.tool_calls.is_empty()).then_some(self.tool_calls),
            images: None,
            tool_name: None,
        }
    }
}
