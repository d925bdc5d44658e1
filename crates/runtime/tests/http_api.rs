//! End-to-end behaviour of the HTTP surface against in-process fakes of the
//! Ollama host and the CORS relays.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower::ServiceExt;

use fireflies_config::AppConfig;
use fireflies_runtime::{AppState, router};

const GOOD_PAGE: &str = "<html><head><title>BMKG</title></head><body><nav>menu</nav>\
<p>Prakiraan cuaca Jakarta hari ini: cerah berawan pada pagi hari dan hujan ringan pada sore hari.</p>\
</body></html>";

const DDG_PAGE: &str = r#"<div class="result"><a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fbmkg.go.id%2F&rut=1">Cuaca Jakarta - BMKG</a><a class="result__snippet">Prakiraan cuaca resmi</a></div>"#;

// ── Fake Ollama ──────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Upstream {
    replies: Arc<Mutex<VecDeque<(u16, String)>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl Upstream {
    fn script(replies: Vec<(u16, String)>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::default(),
        }
    }

    fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

async fn api_chat(State(up): State<Upstream>, Json(body): Json<Value>) -> (StatusCode, String) {
    up.requests.lock().unwrap().push(body);
    let (status, body) = up
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| (200, ndjson(&[done()])));
    (StatusCode::from_u16(status).unwrap(), body)
}

async fn api_tags() -> Json<Value> {
    Json(json!({"models": [{"name": "gpt-oss:120b"}, {"name": "qwen3-vl:235b"}]}))
}

fn ndjson(lines: &[Value]) -> String {
    lines.iter().map(|l| format!("{l}\n")).collect()
}

fn content(text: &str) -> Value {
    json!({"message": {"role": "assistant", "content": text}, "done": false})
}

fn tool_call(name: &str, args: Value) -> Value {
    json!({
        "message": {
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": name, "arguments": args}}]
        },
        "done": false
    })
}

fn done() -> Value {
    json!({"message": {"role": "assistant", "content": ""}, "done": true})
}

// ── Fake relays ──────────────────────────────────────────────────────────────

async fn relay(Query(q): Query<HashMap<String, String>>) -> &'static str {
    let target = q.get("u").cloned().unwrap_or_default();
    if target.starts_with("https://html.duckduckgo.com/") {
        DDG_PAGE
    } else {
        GOOD_PAGE
    }
}

async fn slow_relay() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    GOOD_PAGE
}

async fn broken_relay() -> StatusCode {
    StatusCode::BAD_GATEWAY
}

// ── Harness ──────────────────────────────────────────────────────────────────

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_upstream(up: &Upstream) -> String {
    spawn(
        Router::new()
            .route("/api/chat", post(api_chat))
            .route("/api/tags", get(api_tags))
            .with_state(up.clone()),
    )
    .await
}

async fn spawn_relays() -> String {
    spawn(
        Router::new()
            .route("/ok", get(relay))
            .route("/slow", get(slow_relay))
            .route("/broken", get(broken_relay)),
    )
    .await
}

fn config(upstream: &str, relays: &str, routes: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.llm.base_url = upstream.to_string();
    config.llm.api_key = "test-key".to_string();
    config.fetch.proxy_order = routes.iter().map(|r| format!("{relays}/{r}?u=")).collect();
    config.fetch.timeout_ms = 2_000;
    config
}

fn app(config: AppConfig) -> Router {
    router(AppState::from_config(config).unwrap()).unwrap()
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }

    /// Payloads of each `data:` frame, `[DONE]` included verbatim.
    fn frames(&self) -> Vec<String> {
        self.body
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.strip_prefix("data: ").unwrap().to_string())
            .collect()
    }

    fn events(&self) -> Vec<Value> {
        self.frames()
            .iter()
            .filter(|f| f.as_str() != "[DONE]")
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    fn text(&self) -> String {
        self.events()
            .iter()
            .filter(|e| e["type"] == "content")
            .map(|e| e["content"].as_str().unwrap().to_string())
            .collect()
    }
}

async fn send(app: Router, request: Request<Body>) -> Reply {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    Reply {
        status,
        headers,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

async fn post_json(app: Router, path: &str, body: impl Into<String>) -> Reply {
    let request = Request::post(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.into()))
        .unwrap();
    send(app, request).await
}

// ── /chat ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_prompt_streams_content_then_done() {
    let up = Upstream::script(vec![(
        200,
        ndjson(&[content("AI adalah "), content("kecerdasan buatan."), done()]),
    )]);
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let reply = post_json(
        app(config(&base, &relays, &["ok"])),
        "/chat",
        r#"{"prompt":"Jelaskan AI","useTools":false}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(reply.frames().last().map(String::as_str), Some("[DONE]"));
    assert_eq!(reply.text(), "AI adalah kecerdasan buatan.");
    assert!(reply.events().iter().all(|e| e["type"] != "tool_call"));

    let requests = up.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].get("tools").is_none());
    assert_eq!(requests[0]["model"], "FireFlies:latest-cloud");
    assert_eq!(requests[0]["stream"], true);
    assert_eq!(requests[0]["messages"][0]["role"], "system");
    assert_eq!(requests[0]["messages"][1]["content"], "Jelaskan AI");
}

#[tokio::test]
async fn search_tool_round_trip_makes_two_gateway_calls() {
    let up = Upstream::script(vec![
        (200, ndjson(&[tool_call("webSearch", json!({"query": "cuaca Jakarta"})), done()])),
        (200, ndjson(&[content("Hari ini cerah berawan."), done()])),
    ]);
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let reply = post_json(
        app(config(&base, &relays, &["ok"])),
        "/chat",
        r#"{"prompt":"Bagaimana cuaca Jakarta?","useTools":true,"model":"gpt-oss:120b"}"#,
    )
    .await;

    let events = reply.events();
    let calls: Vec<&Value> = events.iter().filter(|e| e["type"] == "tool_call").collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["function"], "webSearch");
    assert_eq!(calls[0]["arguments"]["query"], "cuaca Jakarta");
    assert_eq!(reply.text(), "Hari ini cerah berawan.");
    assert!(!reply.body.contains("Sources"));

    let requests = up.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["model"], "gpt-oss:120b-cloud");
    assert!(requests[0]["tools"].is_array());
    let tool_turn = requests[1]["messages"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(tool_turn["role"], "tool");
    let result: Value = serde_json::from_str(tool_turn["content"].as_str().unwrap()).unwrap();
    assert_eq!(result["ok"], true);
    assert_eq!(result["payload"]["results"][0]["url"], "https://bmkg.go.id/");
}

#[tokio::test]
async fn fetch_through_dead_relays_fails_softly_and_is_still_cited() {
    let up = Upstream::script(vec![
        (200, ndjson(&[tool_call("webFetch", json!({"url": "https://example.com"})), done()])),
        (200, ndjson(&[content("Halaman tidak dapat dibuka."), done()])),
    ]);
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;
    let mut cfg = config(&base, &relays, &["slow", "slow", "slow"]);
    cfg.fetch.timeout_ms = 100;

    let reply = post_json(
        app(cfg),
        "/chat",
        r#"{"prompt":"Ringkas https://example.com","useTools":true}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    let requests = up.requests();
    assert_eq!(requests.len(), 2);
    let tool_turn = requests[1]["messages"].as_array().unwrap().last().unwrap().clone();
    let result: Value = serde_json::from_str(tool_turn["content"].as_str().unwrap()).unwrap();
    assert_eq!(result["ok"], false);

    let text = reply.text();
    assert!(text.starts_with("Halaman tidak dapat dibuka."));
    assert!(text.contains("**Sources:**\n1. https://example.com\n"));
    assert_eq!(reply.frames().last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn upstream_error_before_output_keeps_status_and_details() {
    let up = Upstream::script(vec![(404, r#"{"error":"model 'ghost' not found"}"#.to_string())]);
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let reply = post_json(
        app(config(&base, &relays, &["ok"])),
        "/chat",
        r#"{"prompt":"halo","model":"ghost"}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    let body = reply.json();
    assert!(body["error"].as_str().unwrap().contains("ghost-cloud"));
    assert!(body["details"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn error_line_after_output_is_a_trailing_error_event() {
    let up = Upstream::script(vec![(
        200,
        ndjson(&[content("Sebagian"), json!({"error": "model overloaded"})]),
    )]);
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let reply = post_json(app(config(&base, &relays, &["ok"])), "/chat", r#"{"prompt":"x"}"#).await;

    assert_eq!(reply.status, StatusCode::OK);
    let events = reply.events();
    assert_eq!(events[0]["type"], "content");
    assert_eq!(events[1]["type"], "error");
    assert!(events[1]["content"].as_str().unwrap().contains("model overloaded"));
    assert_eq!(reply.frames().last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn non_streaming_request_returns_single_json_response() {
    let up = Upstream::script(vec![(200, ndjson(&[content("Halo "), content("dunia"), done()]))]);
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let reply = post_json(
        app(config(&base, &relays, &["ok"])),
        "/chat",
        r#"{"prompt":"sapa aku","stream":false}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json(), json!({"response": "Halo dunia"}));
}

#[tokio::test]
async fn image_request_goes_to_vision_model() {
    let up = Upstream::script(vec![(200, ndjson(&[content("Seekor kucing."), done()]))]);
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let reply = post_json(
        app(config(&base, &relays, &["ok"])),
        "/chat",
        r#"{"prompt":"Gambar apa ini?","image":"data:image/png;base64,iVBORw0KGgo=","useTools":true}"#,
    )
    .await;

    assert_eq!(reply.text(), "Seekor kucing.");
    let request = &up.requests()[0];
    assert_eq!(request["model"], "qwen3-vl:235b-cloud");
    assert!(request.get("tools").is_none());
    assert_eq!(request["options"]["temperature"], 0.1);
    assert_eq!(request["messages"][0]["images"][0], "iVBORw0KGgo=");
}

#[tokio::test]
async fn malformed_json_is_400_even_without_api_key() {
    let mut cfg = AppConfig::default();
    cfg.llm.api_key = String::new();

    let reply = post_json(app(cfg), "/chat", "{not json").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "Invalid JSON in request body");
}

#[tokio::test]
async fn missing_api_key_is_500() {
    let mut cfg = AppConfig::default();
    cfg.llm.api_key = "   ".to_string();

    let reply = post_json(app(cfg), "/chat", r#"{"prompt":"halo"}"#).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply.json()["error"], "Ollama API key not configured");
}

#[tokio::test]
async fn empty_prompt_is_400() {
    let up = Upstream::default();
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let reply = post_json(app(config(&base, &relays, &["ok"])), "/chat", r#"{"prompt":"  "}"#).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(up.requests().is_empty());
}

// ── /models ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn models_are_listed_from_tags() {
    let up = Upstream::default();
    let base = spawn_upstream(&up).await;
    let relays = spawn_relays().await;

    let request = Request::get("/models").body(Body::empty()).unwrap();
    let reply = send(app(config(&base, &relays, &["ok"])), request).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.json()["models"][0]["name"], "gpt-oss:120b");
}

#[tokio::test]
async fn unreachable_model_host_still_answers_200() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let request = Request::get("/models").body(Body::empty()).unwrap();
    let reply = send(app(config(&dead, &dead, &["ok"])), request).await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["models"], json!([]));
    assert_eq!(body["error"], "Failed to fetch models from Ollama Cloud");
}

// ── /search and /web ─────────────────────────────────────────────────────────

#[tokio::test]
async fn search_with_fetch_attaches_excerpts() {
    let relays = spawn_relays().await;
    let reply = post_json(
        app(config("http://127.0.0.1:9", &relays, &["broken", "ok"])),
        "/search",
        r#"{"query":"cuaca Jakarta","fetch":true}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["fallback"], false);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["title"], "Cuaca Jakarta - BMKG");
    assert!(results[0]["content"].as_str().unwrap().starts_with("Prakiraan cuaca Jakarta"));
}

#[tokio::test]
async fn exhausted_search_returns_fallback_links() {
    let relays = spawn_relays().await;
    let reply = post_json(
        app(config("http://127.0.0.1:9", &relays, &["broken", "broken", "broken"])),
        "/search",
        r#"{"query":"kecerdasan buatan"}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["fallback"], true);
    assert_eq!(body["results"].as_array().unwrap().len(), 4);
    assert!(body["results"][0].get("content").is_none());
}

#[tokio::test]
async fn search_without_query_is_400() {
    let reply = post_json(app(AppConfig::default()), "/search", r#"{"query":""}"#).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn web_returns_page_text() {
    let relays = spawn_relays().await;
    let reply = post_json(
        app(config("http://127.0.0.1:9", &relays, &["ok"])),
        "/web",
        r#"{"url":"https://bmkg.go.id/"}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    let body = reply.json();
    assert_eq!(body["url"], "https://bmkg.go.id/");
    assert_eq!(body["title"], "BMKG");
    assert!(!body["content"].as_str().unwrap().contains("menu"));
}

#[tokio::test]
async fn web_without_content_is_400() {
    let relays = spawn_relays().await;
    let reply = post_json(
        app(config("http://127.0.0.1:9", &relays, &["broken"])),
        "/web",
        r#"{"url":"https://bmkg.go.id/"}"#,
    )
    .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.json()["error"], "No meaningful content extracted from webpage");

    let reply = post_json(app(AppConfig::default()), "/web", r#"{"url":"ftp://x"}"#).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

// ── CORS ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn preflight_is_answered_by_cors_layer() {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/chat")
        .header(header::ORIGIN, "https://fireflies.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type,authorization")
        .body(Body::empty())
        .unwrap();
    let reply = send(app(AppConfig::default()), request).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let methods = reply.headers[header::ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap();
    assert!(methods.contains("POST"));
}
