use astryx::accumulator::ChatStore;
use astryx::api::{ApiClient, SessionProvider, StaticSession};
use astryx::streaming::{run_stream, HttpTransport, StreamObserver, StreamOutcome, StreamRequest};
use astryx::*;
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn serve(app: Router) -> String {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("bind failed: {}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("no local addr: {}", e),
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn session(token: Option<&str>) -> Arc<dyn SessionProvider> {
    Arc::new(StaticSession::new(token.map(str::to_string)))
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[derive(Default)]
struct Recorder {
    deltas: Vec<String>,
    completed: Option<String>,
    errors: Vec<String>,
}

impl StreamObserver for Recorder {
    fn on_delta(&mut self, text: &str) {
        self.deltas.push(text.to_string());
    }

    fn on_complete(&mut self, full_text: String) {
        self.completed = Some(full_text);
    }

    fn on_error(&mut self, error: ObservedError) {
        self.errors.push(error.to_string());
    }
}

async fn stream_handler(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    if bearer(&headers).as_deref() != Some("Bearer tok") {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    }
    let query = body["query"].as_str().unwrap_or_default().to_string();
    let chat = body["chat_id"].as_str().unwrap_or_default().to_string();
    if body["user_id"].as_str() != Some("u1") {
        return (StatusCode::BAD_REQUEST, "missing user_id").into_response();
    }
    let events = format!(
        ": keep-alive\n\ndata: {}\n\ndata: {}\n\ndata: {{\"end\":true}}\n\n",
        json!({ "text": format!("{} ", chat) }),
        json!({ "text": query })
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], events).into_response()
}

fn request() -> StreamRequest {
    StreamRequest {
        query: "Why did AAPL drop?".to_string(),
        user_id: "u1".to_string(),
        chat_id: "c1".to_string(),
    }
}

#[tokio::test]
async fn test_http_transport_streams_deltas() {
    let base = serve(Router::new().route("/chat/stream", post(stream_handler))).await;
    let transport = HttpTransport::new(
        reqwest::Client::new(),
        format!("{}/chat/stream", base),
        session(Some("tok")),
    );

    let mut recorder = Recorder::default();
    let outcome = run_stream(&transport, &request(), &CancellationToken::new(), &mut recorder).await;

    assert_eq!(outcome, StreamOutcome::Completed);
    assert_eq!(recorder.deltas, vec!["c1 ", "Why did AAPL drop?"]);
    assert_eq!(recorder.completed.as_deref(), Some("c1 Why did AAPL drop?"));
    assert!(recorder.errors.is_empty());
}

#[tokio::test]
async fn test_http_transport_reports_rejected_request() {
    let base = serve(Router::new().route("/chat/stream", post(stream_handler))).await;
    let transport = HttpTransport::new(
        reqwest::Client::new(),
        format!("{}/chat/stream", base),
        session(None),
    );

    let mut recorder = Recorder::default();
    let outcome = run_stream(&transport, &request(), &CancellationToken::new(), &mut recorder).await;

    match outcome {
        StreamOutcome::Failed(reason) => assert!(reason.contains("401"), "reason: {}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(recorder.deltas.is_empty());
    assert!(recorder.completed.is_none());
    assert_eq!(recorder.errors.len(), 1);
}

#[tokio::test]
async fn test_http_transport_unreachable_host() {
    let transport = HttpTransport::new(
        reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .build()
            .unwrap_or_default(),
        "http://127.0.0.1:9/chat/stream",
        session(None),
    );
    let mut recorder = Recorder::default();
    let outcome = run_stream(&transport, &request(), &CancellationToken::new(), &mut recorder).await;
    assert!(matches!(outcome, StreamOutcome::Failed(_)));
    assert_eq!(recorder.errors.len(), 1);
}

async fn create_chat(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    let owner = match bearer(&headers) {
        Some(_) => "u1",
        None => "anonymous",
    };
    Json(json!({
        "data": { "id": "c9", "userId": owner, "title": body["title"], "createdAt": "2024-05-01T10:00:00Z" },
        "success": true
    }))
}

async fn get_chat(Path(id): Path<String>) -> impl IntoResponse {
    (StatusCode::NOT_FOUND, format!("chat {} not found", id))
}

async fn chat_messages(Path(id): Path<String>) -> impl IntoResponse {
    Json(json!({
        "data": [
            { "id": "2", "chatId": id, "content": "Shares fell 3%.", "isAi": true,
              "aiChartData": [{ "type": "line-basic", "data": [{ "d": "Mon", "p": 10 }], "dataKey": "p" }] },
            { "id": "1", "chatId": id, "content": "What happened?", "isAi": false }
        ]
    }))
}

async fn list_tasks(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let page = params.get("page").cloned().unwrap_or_default();
    let limit = params.get("limit").cloned().unwrap_or_default();
    Json(json!({
        "data": [{ "id": "t1", "query": format!("page={} limit={}", page, limit), "active": true, "event": "TIME_BASED" }]
    }))
}

async fn api_base() -> String {
    let app = Router::new()
        .route("/user/chats", post(create_chat))
        .route("/user/chats/:id", get(get_chat))
        .route("/user/chats/:id/messages", get(chat_messages))
        .route("/user/tasks", get(list_tasks));
    serve(app).await
}

fn client(base: &str, token: Option<&str>) -> ApiClient {
    match ApiClient::new(base, Duration::from_secs(5), Duration::from_secs(1), session(token)) {
        Ok(c) => c,
        Err(e) => panic!("client build failed: {}", e),
    }
}

#[tokio::test]
async fn test_create_chat_truncates_title_and_sends_token() {
    let base = api_base().await;
    let api = client(&base, Some("tok"));
    let prompt = "x".repeat(80);

    let chat = match api.create_chat(&prompt).await {
        Ok(c) => c,
        Err(e) => panic!("create failed: {}", e),
    };
    assert_eq!(chat.id, ChatId::from("c9"));
    assert_eq!(chat.title.chars().count(), 50);
    assert_eq!(chat.user_id.as_deref(), Some("u1"));
    assert!(chat.created_at.is_some());
}

#[tokio::test]
async fn test_missing_chat_is_upstream_error() {
    let base = api_base().await;
    let api = client(&base, None);

    match api.get_chat(&ChatId::from("nope")).await {
        Ok(c) => panic!("expected error, got {:?}", c),
        Err(e) => match e.inner {
            AstryxError::Upstream(status, body) => {
                assert_eq!(status.as_u16(), 404);
                assert!(body.contains("nope"));
            }
            other => panic!("unexpected error: {}", other),
        },
    }
}

#[tokio::test]
async fn test_history_is_stored_oldest_first() {
    let base = api_base().await;
    let api = client(&base, None);
    let chat = ChatId::from("c1");

    let history = match api.chat_messages(&chat).await {
        Ok(h) => h,
        Err(e) => panic!("history failed: {}", e),
    };
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].structured_charts.len(), 1);

    let mut store = ChatStore::new();
    store.set_history_newest_first(&chat, history);
    let messages = store.messages(&chat);
    assert_eq!(messages[0].content, "What happened?");
    assert_eq!(messages[1].content, "Shares fell 3%.");
    assert!(messages.iter().all(|m| !m.is_new_message));
}

#[tokio::test]
async fn test_task_listing_uses_default_paging() {
    let base = api_base().await;
    let api = client(&base, None);

    let tasks = match api.list_tasks(None, Some(5)).await {
        Ok(t) => t,
        Err(e) => panic!("list failed: {}", e),
    };
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].query.as_deref(), Some("page=1 limit=5"));
    assert_eq!(tasks[0].event, Some(astryx::api::EventType::TimeBased));
    assert!(tasks[0].active);
}
