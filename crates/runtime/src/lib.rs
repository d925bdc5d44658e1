pub mod chat;
pub mod error;
pub mod events;
pub mod prompt_builder;
pub mod server;
pub mod tool_loop;

pub use chat::{ChatBody, ChatMode, ChatSession, PreparedChat};
pub use error::{ApiError, ChatError};
pub use events::{DONE_FRAME, EventEmitter, StreamEvent};
pub use server::{AppState, router, serve};
pub use tool_loop::{ITERATION_LIMIT_MESSAGE, LoopLimits, LoopPhase, LoopState, SourceUrls, ToolLoop};
