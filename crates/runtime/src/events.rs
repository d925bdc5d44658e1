//! Normalized events delivered to the HTTP client and their wire framing.

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::ChatError;

/// Terminal frame written after the last event of a response.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking {
        content: String,
    },
    Content {
        content: String,
    },
    ToolCall {
        function: String,
        arguments: Map<String, Value>,
    },
    Error {
        content: String,
    },
    /// End of the response.  Serialized as the `[DONE]` sentinel, not JSON.
    #[serde(skip)]
    Done,
}

impl StreamEvent {
    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { content: text.into() }
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { content: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { content: text.into() }
    }

    /// One `data: ...\n\n` frame.
    pub fn to_frame(&self) -> String {
        match self {
            Self::Done => DONE_FRAME.to_string(),
            event => {
                let json = serde_json::to_string(event)
                    .unwrap_or_else(|_| r#"{"type":"error","content":"unencodable event"}"#.into());
                format!("data: {json}\n\n")
            }
        }
    }
}

/// Write half of the per-request output channel.
///
/// Every send awaits channel capacity, so a slow reader slows the
/// orchestrator down.  A dropped receiver surfaces as
/// [`ChatError::Disconnected`].
#[derive(Debug)]
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    started: bool,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx, started: false }
    }

    /// Whether at least one event has been handed to the client.
    pub fn started(&self) -> bool {
        self.started
    }

    pub async fn emit(&mut self, event: StreamEvent) -> Result<(), ChatError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ChatError::Disconnected)?;
        self.started = true;
        Ok(())
    }

    /// Resolves once the receiving side has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
