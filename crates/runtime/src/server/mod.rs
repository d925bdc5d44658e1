//! HTTP proxy: `/chat`, `/search`, `/web` and `/models` behind a CORS layer.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use fireflies_config::AppConfig;
use fireflies_llm::{ChatBackend, OllamaCloudClient};
use fireflies_tools::fetch::FetchChain;
use fireflies_tools::{ToolRegistry, default_registry};

use crate::chat::ChatSession;
use crate::tool_loop::LoopLimits;

/// Immutable state shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub backend: Arc<dyn ChatBackend>,
    pub tools: Arc<ToolRegistry>,
    pub fetch: Arc<FetchChain>,
}

impl AppState {
    /// Wire the real Ollama client and fetch chain from `config`.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let backend = OllamaCloudClient::new(
            config.llm.base_url.clone(),
            Some(config.llm.api_key.clone()),
            Duration::from_secs(config.llm.connect_timeout_secs),
        )
        .context("failed to build Ollama client")?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Same as [`AppState::from_config`] with a caller-supplied backend.
    pub fn with_backend(config: AppConfig, backend: Arc<dyn ChatBackend>) -> Result<Self> {
        let fetch = Arc::new(
            FetchChain::new(config.fetch.clone()).context("failed to build fetch client")?,
        );
        let tools = Arc::new(default_registry(Arc::clone(&fetch), &config.tools));
        Ok(Self {
            config: Arc::new(config),
            backend,
            tools,
            fetch,
        })
    }

    pub fn session(&self) -> ChatSession {
        ChatSession {
            backend: Arc::clone(&self.backend),
            tools: Arc::clone(&self.tools),
            limits: LoopLimits::from_config(&self.config.tools),
        }
    }
}

pub fn cors_layer(allow_origin: &str) -> Result<CorsLayer> {
    let origin = match allow_origin.trim() {
        "" | "*" => AllowOrigin::any(),
        exact => AllowOrigin::exact(
            HeaderValue::from_str(exact)
                .with_context(|| format!("invalid cors_allow_origin: {exact}"))?,
        ),
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ])
        .max_age(Duration::from_secs(86_400)))
}

pub fn router(state: AppState) -> Result<Router> {
    let cors = cors_layer(&state.config.server.cors_allow_origin)?;
    Ok(Router::new()
        .route("/chat", post(handlers::chat))
        .route("/search", post(handlers::search))
        .route("/web", post(handlers::web))
        .route("/models", get(handlers::models))
        .layer(cors)
        .with_state(state))
}

/// Bind `server.listen_addr` and serve until Ctrl-C.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config.server.listen_addr.clone();
    let app = router(state)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "fireflies proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("server error")?;
    Ok(())
}
