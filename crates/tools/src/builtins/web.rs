//! `webSearch` and `webFetch`, both backed by the relay fallback chain.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;
use url::Url;

use crate::fetch::FetchChain;
use crate::{ParamType, Tool, ToolParam, ToolResult, ToolSpec};

/// Searches DuckDuckGo through the relay chain and returns ordered
/// `{title, url, snippet}` hits.
pub struct WebSearchTool {
    pub chain: Arc<FetchChain>,
    /// Used when the model does not pass `max_results`.
    pub default_results: usize,
    /// Upper bound on `max_results`.
    pub max_results: usize,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "webSearch".to_string(),
            description: "Search the web and return the top results (title, url, snippet). \
                Use it for current events or facts you are unsure about."
                .to_string(),
            params: vec![
                ToolParam::required("query", "Search query string"),
                ToolParam::optional(
                    "max_results",
                    format!("Maximum number of results (default: {})", self.default_results),
                )
                .of_type(ParamType::Integer),
            ],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolResult> {
        let query = args.get("query").map(|q| q.trim()).unwrap_or_default();
        if query.is_empty() {
            bail!("missing required param: query");
        }
        let wanted = args
            .get("max_results")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|n| n.is_finite() && *n >= 1.0)
            .map(|n| n as usize)
            .unwrap_or(self.default_results);
        let limit = wanted.clamp(1, self.max_results.max(1));

        let report = self.chain.search(query, limit).await;
        Ok(match report.result {
            Some(results) => ToolResult::success(json!({
                "query": query,
                "results": results,
            })),
            None => ToolResult::failure(format!(
                "no search results for \"{query}\" ({})",
                report.failure_summary()
            )),
        })
    }
}

/// Fetches one page through the relay chain and returns its text.
pub struct WebFetchTool {
    pub chain: Arc<FetchChain>,
}

impl WebFetchTool {
    fn target(args: &HashMap<String, String>) -> Option<Url> {
        let raw = args.get("url")?.trim();
        let url = Url::parse(raw).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(url)
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "webFetch".to_string(),
            description: "Fetch a web page and return its readable text (up to 8000 characters) \
                and title. Use it on URLs from webSearch results."
                .to_string(),
            params: vec![ToolParam::required("url", "Absolute http(s) URL of the page")],
        }
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolResult> {
        let Some(url) = Self::target(args) else {
            bail!("webFetch needs an absolute http(s) url");
        };
        let raw = args.get("url").map(|u| u.trim()).unwrap_or_default();

        let report = self.chain.fetch_page(raw).await;
        Ok(match report.result {
            Some(page) => ToolResult::success(json!(page)),
            None => ToolResult::failure(format!(
                "could not fetch {url} ({})",
                report.failure_summary()
            )),
        })
    }

    /// Cited whenever the URL is well-formed, even if fetching fails.
    fn source_url(&self, args: &HashMap<String, String>) -> Option<String> {
        Self::target(args)?;
        args.get("url").map(|u| u.trim().to_string())
    }
}
