use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

/// Identifies one in-flight AI response. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl ChatId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl MessageId {
    pub fn user() -> Self {
        Self(format!("user-{}", Uuid::new_v4()))
    }

    pub fn ai() -> Self {
        Self(format!("ai-{}", Uuid::new_v4()))
    }

    pub fn history() -> Self {
        Self(format!("msg-{}", Uuid::new_v4()))
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        crate::str_utils::prefix_chars(&self.0.simple().to_string(), 8).to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResponseTimeMs(pub u64);

impl fmt::Display for ResponseTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 1000 {
            write!(f, "{}ms", self.0)
        } else {
            write!(f, "{:.1}s", self.0 as f64 / 1000.0)
        }
    }
}

/// Accepts either a single value or a list on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }

    /// Single-element lists collapse to `One`, matching the panel patch shape.
    pub fn from_vec(mut items: Vec<T>) -> Self {
        if items.len() == 1 {
            Self::One(items.remove(0))
        } else {
            Self::Many(items)
        }
    }
}

fn deserialize_chart_list<'de, D>(deserializer: D) -> std::result::Result<Vec<ChartSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<OneOrMany<ChartSpec>>::deserialize(deserializer)?;
    Ok(match raw {
        Some(charts) => charts.into_vec(),
        None => Vec::new(),
    })
}

fn deserialize_source_links<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SourceLink>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<SourceLink>>::deserialize(deserializer)?;
    Ok(raw.unwrap_or_default())
}

/// --- CHART PAYLOADS ---

pub type ChartRecord = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChartColor {
    Single(String),
    Palette(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub data: Vec<ChartRecord>,
    pub data_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ChartColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouped_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartFamily {
    Bar,
    Pie,
    Radar,
    Radial,
    Line,
    Area,
    Unsupported,
}

const CHART_FAMILIES: &[(&str, ChartFamily)] = &[
    ("bar-", ChartFamily::Bar),
    ("pie-", ChartFamily::Pie),
    ("radar-", ChartFamily::Radar),
    ("radial-", ChartFamily::Radial),
    ("line-", ChartFamily::Line),
    ("area-", ChartFamily::Area),
];

impl ChartSpec {
    pub fn family(&self) -> ChartFamily {
        CHART_FAMILIES
            .iter()
            .find(|(prefix, _)| self.kind.starts_with(prefix))
            .map(|(_, family)| *family)
            .unwrap_or(ChartFamily::Unsupported)
    }

    pub fn display_title(&self) -> &str {
        match &self.title {
            Some(t) if !t.trim().is_empty() => t,
            _ => &self.kind,
        }
    }
}

impl fmt::Display for ChartFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Bar => "bar",
            Self::Pie => "pie",
            Self::Radar => "radar",
            Self::Radial => "radial",
            Self::Line => "line",
            Self::Area => "area",
            Self::Unsupported => "unsupported",
        };
        write!(f, "{}", label)
    }
}

/// --- MESSAGES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLink {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub is_ai: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_new_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<ResponseTimeMs>,
    #[serde(
        default,
        alias = "aiChartData",
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_chart_list"
    )]
    pub structured_charts: Vec<ChartSpec>,
    #[serde(
        default,
        alias = "aiResponseSources",
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_source_links"
    )]
    pub source_links: Vec<SourceLink>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::user(),
            content: content.into(),
            is_ai: false,
            timestamp: Utc::now(),
            is_new_message: false,
            response_time: None,
            structured_charts: Vec::new(),
            source_links: Vec::new(),
        }
    }

    /// Empty AI message that a stream session appends into.
    pub fn ai_placeholder() -> Self {
        Self {
            id: MessageId::ai(),
            content: String::new(),
            is_ai: true,
            timestamp: Utc::now(),
            is_new_message: true,
            response_time: None,
            structured_charts: Vec::new(),
            source_links: Vec::new(),
        }
    }
}

/// Ordered output of the block extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentSegment {
    Markdown {
        text: String,
    },
    Chart {
        payload: ChartSpec,
    },
    Code {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

impl ContentSegment {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self::Markdown { text: text.into() }
    }

    pub fn is_structured(&self) -> bool {
        !matches!(self, Self::Markdown { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    #[default]
    Initial,
    Thinking,
    Chatting,
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum AstryxError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl AstryxError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into(), SpanTrace::capture())
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: AstryxError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<AstryxError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_time_formatting() {
        assert_eq!(ResponseTimeMs(0).to_string(), "0ms");
        assert_eq!(ResponseTimeMs(999).to_string(), "999ms");
        assert_eq!(ResponseTimeMs(1000).to_string(), "1.0s");
        assert_eq!(ResponseTimeMs(2450).to_string(), "2.5s");
    }

    #[test]
    fn test_legacy_single_chart_object_is_normalized_to_list() {
        let json = r#"{
            "id": "m1",
            "content": "hi",
            "isAi": true,
            "timestamp": "2024-05-01T10:00:00Z",
            "aiChartData": {"type": "bar-standard", "data": [{"a": 1}], "dataKey": "a"}
        }"#;
        let msg: Message = match serde_json::from_str(json) {
            Ok(m) => m,
            Err(e) => panic!("Expected message to parse: {}", e),
        };
        assert_eq!(msg.structured_charts.len(), 1);
        assert_eq!(msg.structured_charts[0].kind, "bar-standard");
        assert!(!msg.is_new_message);
    }

    #[test]
    fn test_null_chart_and_sources_become_empty() {
        let json = r#"{
            "id": "m2",
            "content": "hi",
            "isAi": true,
            "timestamp": "2024-05-01T10:00:00Z",
            "aiChartData": null,
            "aiResponseSources": null
        }"#;
        let msg: Message = match serde_json::from_str(json) {
            Ok(m) => m,
            Err(e) => panic!("Expected message to parse: {}", e),
        };
        assert!(msg.structured_charts.is_empty());
        assert!(msg.source_links.is_empty());
    }

    #[test]
    fn test_chart_family_classification() {
        let mut chart = ChartSpec {
            kind: "line-step".to_string(),
            title: None,
            description: None,
            data: Vec::new(),
            data_key: "v".to_string(),
            name_key: None,
            x_axis_key: None,
            height: None,
            color: None,
            grouped_keys: None,
        };
        assert_eq!(chart.family(), ChartFamily::Line);
        assert_eq!(chart.display_title(), "line-step");
        chart.kind = "heatmap".to_string();
        assert_eq!(chart.family(), ChartFamily::Unsupported);
    }

    #[test]
    fn test_one_or_many_collapse() {
        assert_eq!(OneOrMany::from_vec(vec![1]), OneOrMany::One(1));
        assert_eq!(OneOrMany::from_vec(vec![1, 2]), OneOrMany::Many(vec![1, 2]));
        assert_eq!(OneOrMany::Many(vec![3]).into_vec(), vec![3]);
    }
}
