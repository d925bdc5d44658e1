use std::convert::Infallible;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use fireflies_tools::fetch::{FetchedPage, fallback_results};
use fireflies_tools::html::SearchHit;

use super::AppState;
use crate::chat::ChatBody;
use crate::error::{ApiError, ChatError};
use crate::events::{EventEmitter, StreamEvent};
use crate::tool_loop::LoopState;

type RunOutcome = Result<LoopState, ChatError>;

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| {
        debug!(error = %err, "rejecting malformed request body");
        ApiError::bad_request("Invalid JSON in request body")
    })
}

// ── /chat ────────────────────────────────────────────────────────────────────

pub(super) async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let body: ChatBody = parse_json(&body)?;
    if !state.config.has_api_key() {
        return Err(ApiError::MissingApiKey);
    }
    let prepared = body.prepare(&state.config, &state.tools)?;

    let span = info_span!(
        "chat",
        request_id = %Uuid::new_v4(),
        model = %prepared.model,
        mode = ?prepared.mode
    );
    let model = prepared.model.clone();
    let streaming = prepared.stream;
    let (tx, rx) = mpsc::channel(state.config.server.event_channel_capacity.max(1));
    let session = state.session();

    let task = tokio::spawn(
        async move {
            let mut emitter = EventEmitter::new(tx);
            let outcome = session.run(prepared, &mut emitter).await;
            match &outcome {
                Ok(run) => info!(
                    gateway_calls = run.gateway_calls,
                    tool_calls = run.tool_calls,
                    hit_limit = run.hit_limit,
                    "chat run finished"
                ),
                Err(ChatError::Disconnected) => info!("client disconnected; run abandoned"),
                Err(err) => warn!(error = %err, "chat run failed before any output"),
            }
            outcome
        }
        .instrument(span),
    );

    if streaming {
        stream_response(rx, task, &model).await
    } else {
        collect_response(rx, task, &model).await
    }
}

/// Hold the response until the first event so failures that happen before
/// any output can still be answered with a status code.
async fn stream_response(
    mut rx: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<RunOutcome>,
    model: &str,
) -> Result<Response, ApiError> {
    let Some(first) = rx.recv().await else {
        return Err(run_failure(task.await, model));
    };

    let frames = futures::stream::once(async move { first })
        .chain(ReceiverStream::new(rx))
        .map(|event| Ok::<_, Infallible>(event.to_frame()));

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn collect_response(
    mut rx: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<RunOutcome>,
    model: &str,
) -> Result<Response, ApiError> {
    let mut response = String::new();
    let mut failure = None;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Content { content } => response.push_str(&content),
            StreamEvent::Error { content } => failure = Some(content),
            _ => {}
        }
    }

    match task.await {
        Ok(Ok(_)) => {}
        other => return Err(run_failure(other, model)),
    }

    if let Some(error) = failure {
        return Ok((StatusCode::BAD_GATEWAY, Json(json!({"error": error}))).into_response());
    }
    Ok(Json(json!({"response": response})).into_response())
}

fn run_failure(joined: Result<RunOutcome, JoinError>, model: &str) -> ApiError {
    match joined {
        Ok(Err(ChatError::Llm(err))) => ApiError::from_llm(&err, model),
        Ok(Err(ChatError::Disconnected)) => {
            ApiError::Internal("event channel closed unexpectedly".to_string())
        }
        Ok(Ok(_)) => ApiError::Internal("chat run produced no output".to_string()),
        Err(err) => ApiError::Internal(format!("chat task failed: {err}")),
    }
}

// ── /search ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    query: String,
    #[serde(default, alias = "maxResults")]
    max_results: Option<usize>,
    /// Attach a page excerpt to each result.
    #[serde(default)]
    fetch: bool,
}

#[derive(Debug, Serialize)]
struct SearchResultBody {
    title: String,
    url: String,
    snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

impl From<SearchHit> for SearchResultBody {
    fn from(hit: SearchHit) -> Self {
        Self {
            title: hit.title,
            url: hit.url,
            snippet: hit.snippet,
            content: None,
        }
    }
}

pub(super) async fn search(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body: SearchBody = parse_json(&body)?;
    let query = body.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("Query is required"));
    }
    let limits = &state.config.tools;
    let limit = body
        .max_results
        .unwrap_or(limits.search_default_results)
        .clamp(1, limits.search_max_results.max(1));

    let report = state.fetch.search(query, limit).await;
    let hits = match report.result {
        Some(hits) => hits,
        None => {
            warn!(
                query,
                attempts = %report.failure_summary(),
                "search chain exhausted; answering with fallback links"
            );
            let results: Vec<SearchResultBody> =
                fallback_results(query).into_iter().map(Into::into).collect();
            return Ok(Json(json!({"query": query, "results": results, "fallback": true})));
        }
    };

    let results: Vec<SearchResultBody> = if body.fetch {
        let excerpts = join_all(hits.iter().map(|hit| state.fetch.fetch_excerpt(&hit.url))).await;
        hits.into_iter()
            .zip(excerpts)
            .filter_map(|(hit, excerpt)| {
                let content = excerpt.result?;
                Some(SearchResultBody {
                    content: Some(content),
                    ..SearchResultBody::from(hit)
                })
            })
            .collect()
    } else {
        hits.into_iter().map(Into::into).collect()
    };
    info!(query, results = results.len(), fetched = body.fetch, "search answered");
    Ok(Json(json!({"query": query, "results": results, "fallback": false})))
}

// ── /web ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WebBody {
    #[serde(default)]
    url: String,
}

pub(super) async fn web(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<FetchedPage>, ApiError> {
    let body: WebBody = parse_json(&body)?;
    let url = body.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::bad_request("A valid http(s) URL is required"));
    }

    let report = state.fetch.fetch_page(url).await;
    match report.result {
        Some(page) => Ok(Json(page)),
        None => {
            warn!(url, attempts = %report.failure_summary(), "web fetch produced no content");
            Err(ApiError::bad_request(
                "No meaningful content extracted from webpage",
            ))
        }
    }
}

// ── /models ──────────────────────────────────────────────────────────────────

pub(super) async fn models(State(state): State<AppState>) -> Json<Value> {
    match state.backend.list_models().await {
        Ok(models) => Json(json!({"models": models})),
        Err(err) => {
            warn!(error = %err, "model listing failed");
            Json(json!({
                "models": [],
                "error": "Failed to fetch models from Ollama Cloud",
            }))
        }
    }
}
