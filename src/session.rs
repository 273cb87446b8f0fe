use crate::accumulator::AccumulatorHandle;
use crate::streaming::{run_stream, StreamObserver, StreamOutcome, StreamRequest, StreamTransport};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Ids a caller needs to follow a submitted prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub session_id: SessionId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// One in-flight AI response.
pub struct StreamSession {
    pub ticket: SessionTicket,
    pub started_at: Instant,
    cancel: CancellationToken,
    task: JoinHandle<StreamOutcome>,
}

impl StreamSession {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Bridges stream callbacks into accumulator commands.
struct AccumulatorSink {
    handle: AccumulatorHandle,
    ticket: SessionTicket,
    received_bytes: usize,
}

impl StreamObserver for AccumulatorSink {
    fn on_delta(&mut self, text: &str) {
        self.received_bytes += text.len();
        let t = &self.ticket;
        if let Err(e) = self
            .handle
            .append(&t.chat_id, &t.message_id, t.session_id, text)
        {
            tracing::error!("[SESSION] Dropped delta: {}", e.inner);
        }
    }

    fn on_complete(&mut self, full_text: String) {
        tracing::debug!(
            "[SESSION] Complete: {} chars ({} bytes received)",
            full_text.chars().count(),
            self.received_bytes
        );
    }

    fn on_error(&mut self, error: ObservedError) {
        tracing::error!(
            "[SESSION] Stream failed after {} bytes: {}",
            self.received_bytes,
            error
        );
    }
}

/// Starts and aborts stream sessions, at most one per chat. Submitting a new
/// prompt to a chat aborts the session already running there.
pub struct ChatController {
    transport: Arc<dyn StreamTransport>,
    accumulator: AccumulatorHandle,
    user_id: UserId,
    active: HashMap<ChatId, StreamSession>,
}

impl ChatController {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        accumulator: AccumulatorHandle,
        user_id: UserId,
    ) -> Self {
        Self {
            transport,
            accumulator,
            user_id,
            active: HashMap::new(),
        }
    }

    pub fn accumulator(&self) -> &AccumulatorHandle {
        &self.accumulator
    }

    /// Records the prompt and an empty AI message, then streams the reply
    /// into that message on a background task.
    pub fn submit_prompt(&mut self, chat_id: &ChatId, query: &str) -> Result<SessionTicket> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AstryxError::Protocol("empty prompt".to_string()).into());
        }

        if self.abort(chat_id) {
            tracing::info!("[SESSION] Superseded running stream in chat {}", chat_id.short());
        }

        let prompt = Message::user(query);
        let placeholder = Message::ai_placeholder();
        let ticket = SessionTicket {
            session_id: SessionId::new(),
            chat_id: chat_id.clone(),
            message_id: placeholder.id.clone(),
        };
        self.accumulator
            .begin_session(chat_id, ticket.session_id, prompt, placeholder)?;

        let request = StreamRequest {
            query: query.to_string(),
            user_id: self.user_id.0.clone(),
            chat_id: chat_id.0.clone(),
        };
        let cancel = CancellationToken::new();
        let started_at = Instant::now();
        let span = tracing::info_span!(
            "stream",
            chat = %chat_id.short(),
            session = %ticket.session_id.short()
        );

        let task = tokio::spawn(
            stream_task(
                self.transport.clone(),
                request,
                cancel.clone(),
                AccumulatorSink {
                    handle: self.accumulator.clone(),
                    ticket: ticket.clone(),
                    received_bytes: 0,
                },
                started_at,
            )
            .instrument(span),
        );

        self.active.insert(
            chat_id.clone(),
            StreamSession {
                ticket: ticket.clone(),
                started_at,
                cancel,
                task,
            },
        );
        Ok(ticket)
    }

    /// Cancels the chat's running session. Content received so far stays in
    /// the message. Returns whether a session was running.
    pub fn abort(&mut self, chat_id: &ChatId) -> bool {
        match self.active.remove(chat_id) {
            Some(session) => {
                let was_running = !session.is_finished();
                session.cancel.cancel();
                was_running
            }
            None => false,
        }
    }

    pub fn is_streaming(&self, chat_id: &ChatId) -> bool {
        match self.active.get(chat_id) {
            Some(s) => !s.is_finished(),
            None => false,
        }
    }

    pub fn session(&self, chat_id: &ChatId) -> Option<&StreamSession> {
        self.active.get(chat_id)
    }

    /// Waits for the chat's session to end and returns its outcome.
    pub async fn wait(&mut self, chat_id: &ChatId) -> Option<StreamOutcome> {
        let session = self.active.remove(chat_id)?;
        match session.task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!("[SESSION] Stream task failed: {}", e);
                None
            }
        }
    }

    /// Aborts every running session.
    pub fn shutdown(&mut self) {
        for (chat_id, session) in self.active.drain() {
            tracing::debug!("[SESSION] Aborting stream in chat {} on shutdown", chat_id.short());
            session.cancel.cancel();
        }
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn stream_task(
    transport: Arc<dyn StreamTransport>,
    request: StreamRequest,
    cancel: CancellationToken,
    mut sink: AccumulatorSink,
    started_at: Instant,
) -> StreamOutcome {
    tracing::info!("[SESSION] Stream started");
    let outcome = run_stream(transport.as_ref(), &request, &cancel, &mut sink).await;

    let response_time = match outcome {
        StreamOutcome::Completed => Some(ResponseTimeMs(started_at.elapsed().as_millis() as u64)),
        _ => None,
    };
    if let Some(rt) = response_time {
        tracing::info!("[SESSION] Response time: {}", rt);
    }

    let t = &sink.ticket;
    if let Err(e) = sink.handle.finish(
        &t.chat_id,
        &t.message_id,
        t.session_id,
        outcome.clone(),
        response_time,
    ) {
        tracing::error!("[SESSION] Could not finalize message: {}", e.inner);
    }
    outcome
}
