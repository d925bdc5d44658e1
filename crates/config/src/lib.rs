use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Server ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the HTTP proxy binds to.  Overridden by the
    /// `FIREFLIES_LISTEN` environment variable when set.
    pub listen_addr: String,
    /// Value for `Access-Control-Allow-Origin`.  `"*"` allows any origin.
    pub cors_allow_origin: String,
    /// Capacity of the per-request event channel between the orchestrator and
    /// the response body.  Small values propagate client backpressure sooner.
    pub event_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8787".to_string(),
            cors_allow_origin: "*".to_string(),
            event_channel_capacity: 64,
        }
    }
}

// ── Upstream LLM ──────────────────────────────────────────────────────────────

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are FireFlies, a helpful assistant. \
Answer in the language the user writes in. Be accurate and concise, and say \
plainly when you are not sure about something.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the Ollama host.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    /// Bearer token for Ollama Cloud.  Usually left empty in the file and
    /// supplied through `OLLAMA_API_KEY`.
    pub api_key: String,
    /// Model used when a request does not name one.
    pub default_model: String,
    /// Model used for every request carrying an image.
    pub vision_model: String,
    /// Suffix appended to model ids that do not already end with it.  Empty
    /// disables the rewrite.
    pub cloud_suffix: String,
    /// System turn injected at the start of every conversation.
    pub system_prompt: String,
    /// Connect timeout for upstream requests.  Streaming reads are not
    /// bounded so long generations are not cut off.
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ollama.com".to_string(),
            api_key: String::new(),
            default_model: "FireFlies:latest".to_string(),
            vision_model: "qwen3-vl:235b-cloud".to_string(),
            cloud_suffix: "-cloud".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl LlmConfig {
    /// Map a requested model id onto the id the cloud host serves.
    pub fn cloud_model(&self, requested: Option<&str>) -> String {
        let model = requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model);
        if self.cloud_suffix.is_empty() || model.ends_with(&self.cloud_suffix) {
            model.to_string()
        } else {
            format!("{model}{}", self.cloud_suffix)
        }
    }
}

// ── Tool loop ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Hard cap on upstream calls within one tool-enabled request.
    pub max_iterations: usize,
    /// Iterations (1-based, inclusive) in which tool schemas are offered.
    /// Later iterations withhold tools to force a final answer.
    pub tool_iterations: usize,
    /// `max_results` used by `webSearch` when the model omits it.
    pub search_default_results: usize,
    /// Upper bound on `max_results`, whatever the model asks for.
    pub search_max_results: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            tool_iterations: 3,
            search_default_results: 4,
            search_max_results: 10,
        }
    }
}

// ── Fallback fetch chain ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// CORS relay prefixes, tried in order.  The percent-encoded target URL
    /// is appended to each prefix.
    pub proxy_order: Vec<String>,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Minimum extracted text length for a page fetch to be accepted.
    pub min_content_length: usize,
    /// Character cap for page fetches (`webFetch`, `/web`).
    pub page_char_cap: usize,
    /// Character cap for excerpts attached to search results.
    pub excerpt_char_cap: usize,
    /// Search engine HTML endpoint; the query is appended percent-encoded.
    pub search_endpoint: String,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            proxy_order: vec![
                "https://corsproxy.io/?".to_string(),
                "https://api.codetabs.com/v1/proxy?quest=".to_string(),
                "https://thingproxy.freeboard.io/fetch/".to_string(),
            ],
            timeout_ms: 10_000,
            min_content_length: 50,
            page_char_cap: 8_000,
            excerpt_char_cap: 3_000,
            search_endpoint: "https://html.duckduckgo.com/html/?q=".to_string(),
            user_agent: "Mozilla/5.0 (compatible; FireFlies/0.1)".to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// When non-empty, logs are also written to a daily rolling file here.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub fetch: FetchConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides (take precedence over the config file).
    fn apply_env(&mut self) {
        if let Ok(key) = env::var("OLLAMA_API_KEY") {
            if !key.trim().is_empty() {
                self.llm.api_key = key.trim().to_string();
            }
        }
        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.trim().is_empty() {
                self.llm.base_url = value.trim().to_string();
            }
        }
        if let Ok(value) = env::var("FIREFLIES_LISTEN") {
            if !value.trim().is_empty() {
                self.server.listen_addr = value.trim().to_string();
            }
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        !self.llm.api_key.trim().is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
