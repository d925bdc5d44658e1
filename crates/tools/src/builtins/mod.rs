//! Built-in tool implementations.

use std::sync::Arc;

use fireflies_config::ToolsConfig;

use crate::ToolRegistry;
use crate::fetch::FetchChain;

mod web;

pub use web::{WebFetchTool, WebSearchTool};

/// Registry with the tools offered to the model, in schema order.
pub fn default_registry(chain: Arc<FetchChain>, config: &ToolsConfig) -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(WebSearchTool {
        chain: Arc::clone(&chain),
        default_results: config.search_default_results,
        max_results: config.search_max_results,
    }));
    registry.register(Box::new(WebFetchTool { chain }));
    registry
}
