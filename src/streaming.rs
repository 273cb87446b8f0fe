#![allow(clippy::manual_unwrap_or_default)]
use crate::api::SessionProvider;
use crate::logging::StreamMetric;
use crate::sse::{self, SseEventParser, StreamPayload};
use crate::types::*;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Request body of the chat stream endpoint. Field names go out in snake_case.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StreamRequest {
    pub query: String,
    pub user_id: String,
    pub chat_id: String,
}

/// Raw response body of an opened stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Opens the byte stream for one AI response.
pub trait StreamTransport: Send + Sync {
    fn open(&self, request: &StreamRequest) -> BoxFuture<'static, Result<ByteStream>>;
}

/// Receives the decoded stream. `on_complete` and `on_error` are terminal and
/// mutually exclusive; no call follows either of them.
pub trait StreamObserver: Send {
    fn on_delta(&mut self, text: &str);
    fn on_complete(&mut self, full_text: String);
    fn on_error(&mut self, error: ObservedError);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
    Aborted,
}

impl StreamOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Streaming,
    Finished,
}

/// POSTs the query as JSON and hands back the `text/event-stream` body.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            session,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl StreamTransport for HttpTransport {
    fn open(&self, request: &StreamRequest) -> BoxFuture<'static, Result<ByteStream>> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = self.session.access_token() {
            builder = builder.bearer_auth(token);
        }

        Box::pin(async move {
            let response = builder.send().await.map_err(AstryxError::Network)?;
            let status = response.status();
            tracing::info!("[STREAM] Status: {}", status);

            if !status.is_success() {
                let body = match response.text().await {
                    Ok(t) => t,
                    Err(e) => format!("(body unreadable: {})", e),
                };
                tracing::error!("[STREAM] Upstream error: {}", body);
                return Err(AstryxError::Upstream(status, body).into());
            }

            let body = response
                .bytes_stream()
                .map(|r| r.map_err(std::io::Error::other));
            Ok(Box::pin(body) as ByteStream)
        })
    }
}

/// Opens a stream and feeds it to `observer` until the end marker, an error,
/// or cancellation. After `cancel` fires the observer is never called again.
pub async fn run_stream<O>(
    transport: &dyn StreamTransport,
    request: &StreamRequest,
    cancel: &CancellationToken,
    observer: &mut O,
) -> StreamOutcome
where
    O: StreamObserver + ?Sized,
{
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!("[STREAM] Aborted before the response arrived");
            return StreamOutcome::Aborted;
        }
        opened = transport.open(request) => opened,
    };

    match opened {
        Ok(body) => consume_stream(body, cancel, observer).await,
        Err(e) => {
            let reason = e.inner.to_string();
            observer.on_error(e);
            StreamOutcome::Failed(reason)
        }
    }
}

/// Decodes an already-open body. Line splitting happens on bytes, so a UTF-8
/// sequence or an event split across chunks is reassembled before decoding.
pub async fn consume_stream<S, O>(
    body: S,
    cancel: &CancellationToken,
    observer: &mut O,
) -> StreamOutcome
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    O: StreamObserver + ?Sized,
{
    let mut lines = FramedRead::new(
        StreamReader::new(body),
        LinesCodec::new_with_max_length(crate::constants::MAX_SSE_LINE_BYTES),
    );
    let mut parser = SseEventParser::new();
    let mut full_text = String::new();
    let mut metrics = StreamMetric::new();
    let mut state = StreamState::Streaming;

    while state == StreamState::Streaming {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("[STREAM] Aborted after {} chars", full_text.len());
                metrics.log_summary("aborted");
                return StreamOutcome::Aborted;
            }
            next = lines.next() => next,
        };

        let event = match next {
            Some(Ok(line)) => parser.push_line(&line),
            Some(Err(e)) => {
                let error = line_error(e);
                let reason = error.inner.to_string();
                metrics.log_summary("failed");
                observer.on_error(error);
                return StreamOutcome::Failed(reason);
            }
            None => {
                state = StreamState::Finished;
                parser.finish()
            }
        };

        let Some(data) = event else { continue };
        metrics.record_event();
        let Some(payload) = sse::parse_payload(&data) else { continue };

        match apply_payload(payload, &mut full_text, &mut metrics, observer) {
            PayloadFlow::Continue => {}
            PayloadFlow::End => {
                tracing::debug!("[STREAM] End marker received");
                metrics.log_summary("completed");
                observer.on_complete(full_text);
                return StreamOutcome::Completed;
            }
            PayloadFlow::Failed(reason) => {
                metrics.log_summary("failed");
                observer.on_error(AstryxError::Protocol(reason.clone()).into());
                return StreamOutcome::Failed(reason);
            }
        }
    }

    let reason = "stream closed before end marker".to_string();
    tracing::warn!("[STREAM] {} ({} chars received)", reason, full_text.len());
    metrics.log_summary("truncated");
    observer.on_error(AstryxError::Protocol(reason.clone()).into());
    StreamOutcome::Failed(reason)
}

enum PayloadFlow {
    Continue,
    End,
    Failed(String),
}

fn apply_payload<O>(
    payload: StreamPayload,
    full_text: &mut String,
    metrics: &mut StreamMetric,
    observer: &mut O,
) -> PayloadFlow
where
    O: StreamObserver + ?Sized,
{
    if let Some(error) = payload.error.as_deref() {
        tracing::error!("[STREAM] Backend reported error: {}", error);
        return PayloadFlow::Failed(error.to_string());
    }

    // A payload may carry its last delta together with the end marker.
    if let Some(delta) = payload.delta() {
        full_text.push_str(delta);
        metrics.record_delta(delta);
        observer.on_delta(delta);
    }

    if payload.is_end() {
        PayloadFlow::End
    } else {
        PayloadFlow::Continue
    }
}

fn line_error(e: LinesCodecError) -> ObservedError {
    tracing::error!("[STREAM] Line decode error: {}", e);
    match e {
        LinesCodecError::Io(io) => AstryxError::Io(io).into(),
        LinesCodecError::MaxLineLengthExceeded => {
            AstryxError::Protocol("max line length exceeded".to_string()).into()
        }
    }
}
