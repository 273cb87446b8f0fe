#![allow(clippy::manual_unwrap_or_default)]
use crate::constants::*;
use crate::str_utils;
use crate::types::*;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Source of the bearer token. The session itself is opaque to this crate.
pub trait SessionProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn sign_out(&self);
}

/// Session backed by a fixed token, e.g. from the environment.
#[derive(Debug, Default)]
pub struct StaticSession {
    token: RwLock<Option<String>>,
}

impl StaticSession {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.trim().is_empty())),
        }
    }
}

impl SessionProvider for StaticSession {
    fn access_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(t) => t.clone(),
            Err(_) => None,
        }
    }

    fn sign_out(&self) {
        if let Ok(mut t) = self.token.write() {
            *t = None;
        }
    }
}

/// Envelope every REST endpoint wraps its payload in.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: ChatId,
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A message as the backend stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    pub content: String,
    pub is_ai: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "aiChartData")]
    pub ai_chart_data: Option<OneOrMany<ChartSpec>>,
    #[serde(default, rename = "aiResponseSources")]
    pub ai_response_sources: Option<Vec<SourceLink>>,
}

impl StoredMessage {
    /// Converts to a display message. History never animates.
    pub fn into_message(self) -> Message {
        Message {
            id: match self.id {
                Some(id) => MessageId(id),
                None => MessageId::history(),
            },
            content: self.content,
            is_ai: self.is_ai,
            timestamp: match self.created_at {
                Some(t) => t,
                None => Utc::now(),
            },
            is_new_message: false,
            response_time: None,
            structured_charts: match self.ai_chart_data {
                Some(c) => c.into_vec(),
                None => Vec::new(),
            },
            source_links: self.ai_response_sources.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TimeBased,
    EventBased,
    TimeAndEvent,
    OneTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub task_query: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub event: Option<EventType>,
    #[serde(default, rename = "scheduled_datetime")]
    pub scheduled_datetime: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub email: bool,
    pub push: bool,
    pub in_app: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            email: false,
            push: false,
            in_app: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    pub cron_expression: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub notification_settings: NotificationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupportEmail {
    pub username: String,
    pub useremail: String,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewMessageBody<'a> {
    content: &'a str,
    is_ai: bool,
}

/// REST client for chats, tasks, support and health.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    session: Arc<dyn SessionProvider>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self::with_client(client, base_url, session))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<dyn SessionProvider> {
        &self.session
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match self.session.access_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();
        let url = response.url().path().to_string();
        tracing::debug!("[API] {} -> {}", url, status);

        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(e) => format!("(body unreadable: {})", e),
            };
            tracing::warn!("[API] {} failed: {}", url, str_utils::snippet(&body, 200));
            return Err(AstryxError::Upstream(status, body).into());
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn send_data<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let envelope: ApiResponse<T> = self.send(builder).await?;
        Ok(envelope.data)
    }

    /// Creates a chat titled after the first prompt.
    pub async fn create_chat(&self, first_prompt: &str) -> Result<ChatSummary> {
        let title = str_utils::prefix_chars(first_prompt.trim(), CHAT_TITLE_MAX_CHARS);
        self.send_data(
            self.request(Method::POST, "/user/chats")
                .json(&serde_json::json!({ "title": title })),
        )
        .await
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        self.send_data(self.request(Method::GET, "/user/chats"))
            .await
    }

    pub async fn get_chat(&self, chat_id: &ChatId) -> Result<ChatSummary> {
        self.send_data(self.request(Method::GET, &format!("/user/chats/{}", chat_id)))
            .await
    }

    pub async fn delete_chat(&self, chat_id: &ChatId) -> Result<()> {
        let _: serde_json::Value = self
            .send(self.request(Method::DELETE, &format!("/user/chats/{}", chat_id)))
            .await?;
        Ok(())
    }

    /// Chat history, newest first as the backend returns it.
    pub async fn chat_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>> {
        let stored: Vec<StoredMessage> = self
            .send_data(self.request(Method::GET, &format!("/user/chats/{}/messages", chat_id)))
            .await?;
        Ok(stored.into_iter().map(StoredMessage::into_message).collect())
    }

    /// Persists a message and reports how long the round trip took.
    pub async fn add_message(
        &self,
        chat_id: &ChatId,
        content: &str,
        is_ai: bool,
    ) -> Result<(StoredMessage, ResponseTimeMs)> {
        let started = Instant::now();
        let stored: StoredMessage = self
            .send_data(
                self.request(Method::POST, &format!("/user/chats/{}/messages", chat_id))
                    .json(&NewMessageBody { content, is_ai }),
            )
            .await?;
        Ok((stored, ResponseTimeMs(started.elapsed().as_millis() as u64)))
    }

    pub async fn list_tasks(&self, page: Option<u32>, limit: Option<u32>) -> Result<Vec<Task>> {
        let page = page.unwrap_or(DEFAULT_TASK_PAGE);
        let limit = limit.unwrap_or(DEFAULT_TASK_LIMIT);
        self.send_data(
            self.request(Method::GET, "/user/tasks")
                .query(&[("page", page), ("limit", limit)]),
        )
        .await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.send_data(self.request(Method::GET, &format!("/user/tasks/{}", task_id)))
            .await
    }

    /// Deactivates a task; the backend keeps the record.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .send(self.request(Method::DELETE, &format!("/user/tasks/{}", task_id)))
            .await?;
        Ok(())
    }

    pub async fn create_task(&self, request: &CreateTaskRequest) -> Result<Task> {
        self.send_data(self.request(Method::POST, "/user/tasks").json(request))
            .await
    }

    pub async fn send_support_email(&self, payload: &SupportEmail) -> Result<()> {
        let _: serde_json::Value = self
            .send(
                self.request(Method::POST, "/third-party/send-email")
                    .json(payload),
            )
            .await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.send(self.request(Method::GET, "/health")).await
    }
}
