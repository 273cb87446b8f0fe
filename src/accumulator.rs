#![allow(clippy::manual_unwrap_or_default)]
use crate::constants::CHAT_STORE_KEY;
use crate::settings::{self, KeyValueStore};
use crate::streaming::StreamOutcome;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Messages per chat plus the current-chat pointer. Chat states and the
/// active session per chat are runtime-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStore {
    #[serde(default)]
    current_chat_id: Option<ChatId>,
    #[serde(default)]
    chat_title: Option<String>,
    #[serde(default)]
    chat_messages: BTreeMap<ChatId, Vec<Message>>,
    #[serde(skip)]
    chat_states: HashMap<ChatId, ChatState>,
    #[serde(skip)]
    active_sessions: HashMap<ChatId, SessionId>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(store: &dyn KeyValueStore) -> Result<Self> {
        settings::load_json(store, CHAT_STORE_KEY)
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        settings::save_json(store, CHAT_STORE_KEY, self)
    }

    pub fn current_chat_id(&self) -> Option<&ChatId> {
        self.current_chat_id.as_ref()
    }

    pub fn chat_title(&self) -> Option<&str> {
        self.chat_title.as_deref()
    }

    pub fn set_current_chat(&mut self, chat_id: Option<ChatId>, title: Option<String>) {
        self.current_chat_id = chat_id;
        self.chat_title = title;
    }

    pub fn chat_ids(&self) -> impl Iterator<Item = &ChatId> {
        self.chat_messages.keys()
    }

    /// Creates an empty message list for `chat_id` unless one exists.
    pub fn initialize_chat(&mut self, chat_id: &ChatId) {
        self.chat_messages.entry(chat_id.clone()).or_default();
    }

    pub fn remove_chat(&mut self, chat_id: &ChatId) -> bool {
        self.chat_states.remove(chat_id);
        self.active_sessions.remove(chat_id);
        if self.current_chat_id.as_ref() == Some(chat_id) {
            self.current_chat_id = None;
            self.chat_title = None;
        }
        self.chat_messages.remove(chat_id).is_some()
    }

    pub fn messages(&self, chat_id: &ChatId) -> &[Message] {
        match self.chat_messages.get(chat_id) {
            Some(m) => m,
            None => &[],
        }
    }

    pub fn message(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<&Message> {
        self.messages(chat_id).iter().find(|m| &m.id == message_id)
    }

    fn message_mut(&mut self, chat_id: &ChatId, message_id: &MessageId) -> Option<&mut Message> {
        self.chat_messages
            .get_mut(chat_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| &m.id == message_id))
    }

    pub fn add_message(&mut self, chat_id: &ChatId, message: Message) {
        self.chat_messages
            .entry(chat_id.clone())
            .or_default()
            .push(message);
    }

    pub fn set_messages(&mut self, chat_id: &ChatId, messages: Vec<Message>) {
        self.chat_messages.insert(chat_id.clone(), messages);
    }

    /// The backend returns history newest first; the store keeps oldest first.
    pub fn set_history_newest_first(&mut self, chat_id: &ChatId, mut messages: Vec<Message>) {
        messages.reverse();
        for m in messages.iter_mut() {
            m.is_new_message = false;
        }
        self.set_messages(chat_id, messages);
    }

    /// Appends `delta` to a message and returns the new content length.
    pub fn append(&mut self, chat_id: &ChatId, message_id: &MessageId, delta: &str) -> Result<usize> {
        match self.message_mut(chat_id, message_id) {
            Some(m) => {
                m.content.push_str(delta);
                Ok(m.content.len())
            }
            None => Err(AstryxError::internal(format!(
                "append to unknown message {} in chat {}",
                message_id, chat_id
            ))
            .into()),
        }
    }

    pub fn finish_message(
        &mut self,
        chat_id: &ChatId,
        message_id: &MessageId,
        response_time: Option<ResponseTimeMs>,
    ) -> bool {
        match self.message_mut(chat_id, message_id) {
            Some(m) => {
                if response_time.is_some() {
                    m.response_time = response_time;
                }
                true
            }
            None => false,
        }
    }

    pub fn chat_state(&self, chat_id: &ChatId) -> ChatState {
        match self.chat_states.get(chat_id) {
            Some(s) => *s,
            None => ChatState::default(),
        }
    }

    pub fn set_chat_state(&mut self, chat_id: &ChatId, state: ChatState) {
        self.chat_states.insert(chat_id.clone(), state);
    }

    pub fn active_session(&self, chat_id: &ChatId) -> Option<SessionId> {
        self.active_sessions.get(chat_id).copied()
    }

    fn is_active(&self, chat_id: &ChatId, session: SessionId) -> bool {
        self.active_sessions.get(chat_id) == Some(&session)
    }
}

/// Observable state transitions, one per applied mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageAdded {
        chat_id: ChatId,
        message_id: MessageId,
        is_ai: bool,
    },
    Appended {
        chat_id: ChatId,
        message_id: MessageId,
        delta: String,
        total_len: usize,
    },
    StreamFinished {
        chat_id: ChatId,
        message_id: MessageId,
        outcome: StreamOutcome,
        response_time: Option<ResponseTimeMs>,
    },
    StateChanged {
        chat_id: ChatId,
        state: ChatState,
    },
    HistoryLoaded {
        chat_id: ChatId,
        count: usize,
    },
}

pub enum AccumulatorCommand {
    BeginSession {
        chat_id: ChatId,
        session: SessionId,
        prompt: Message,
        placeholder: Message,
    },
    Append {
        chat_id: ChatId,
        message_id: MessageId,
        session: SessionId,
        delta: String,
    },
    Finish {
        chat_id: ChatId,
        message_id: MessageId,
        session: SessionId,
        outcome: StreamOutcome,
        response_time: Option<ResponseTimeMs>,
    },
    AddMessage {
        chat_id: ChatId,
        message: Message,
    },
    SetHistory {
        chat_id: ChatId,
        newest_first: Vec<Message>,
    },
    SetCurrentChat {
        chat_id: Option<ChatId>,
        title: Option<String>,
    },
    RemoveChat {
        chat_id: ChatId,
        resp: oneshot::Sender<bool>,
    },
    GetMessages {
        chat_id: ChatId,
        resp: oneshot::Sender<Vec<Message>>,
    },
    GetMessage {
        chat_id: ChatId,
        message_id: MessageId,
        resp: oneshot::Sender<Option<Message>>,
    },
    GetChatState {
        chat_id: ChatId,
        resp: oneshot::Sender<ChatState>,
    },
    Snapshot {
        resp: oneshot::Sender<ChatStore>,
    },
    Persist {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// A serialized snapshot waiting to be written.
struct PersistJob {
    raw: String,
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// Writes snapshots on the blocking pool, one at a time and in queue order,
/// so file I/O never stalls the command loop.
struct PersistWriter {
    tx: mpsc::UnboundedSender<PersistJob>,
    task: JoinHandle<()>,
}

impl PersistWriter {
    fn spawn(store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(store, rx));
        Self { tx, task }
    }

    async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            tracing::error!("[ACCUMULATOR] Persist writer failed: {}", e);
        }
    }
}

async fn write_loop(store: Arc<dyn KeyValueStore>, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        let store = store.clone();
        let raw = job.raw;
        let result = match tokio::task::spawn_blocking(move || store.set(CHAT_STORE_KEY, &raw)).await {
            Ok(r) => r,
            Err(e) => Err(AstryxError::Storage(format!("write task failed: {}", e)).into()),
        };
        match job.ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!("[ACCUMULATOR] Failed to persist chat store: {}", e.inner);
                }
            }
        }
    }
}

/// Single writer over the `ChatStore`. Commands apply strictly in arrival
/// order; each mutation is broadcast as a `ChatEvent`.
pub struct Accumulator {
    store: ChatStore,
    persistence: Option<Arc<dyn KeyValueStore>>,
    writer: Option<PersistWriter>,
    tx_events: broadcast::Sender<ChatEvent>,
    rx_cmd: mpsc::UnboundedReceiver<AccumulatorCommand>,
}

impl Accumulator {
    pub fn new(
        store: ChatStore,
        persistence: Option<Arc<dyn KeyValueStore>>,
        tx_events: broadcast::Sender<ChatEvent>,
        rx_cmd: mpsc::UnboundedReceiver<AccumulatorCommand>,
    ) -> Self {
        Self {
            store,
            persistence,
            writer: None,
            tx_events,
            rx_cmd,
        }
    }

    /// Runs until every handle is dropped, then persists and returns the store.
    pub async fn run(mut self) -> ChatStore {
        tracing::debug!("[ACCUMULATOR] Event loop started");
        self.writer = self.persistence.clone().map(PersistWriter::spawn);
        while let Some(cmd) = self.rx_cmd.recv().await {
            self.handle(cmd);
        }
        self.persist_quietly();
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
        tracing::debug!("[ACCUMULATOR] Event loop stopped");
        self.store
    }

    fn handle(&mut self, cmd: AccumulatorCommand) {
        match cmd {
            AccumulatorCommand::BeginSession {
                chat_id,
                session,
                prompt,
                placeholder,
            } => {
                self.store.active_sessions.insert(chat_id.clone(), session);
                self.add_message(&chat_id, prompt);
                self.add_message(&chat_id, placeholder);
                self.set_state(&chat_id, ChatState::Thinking);
                self.persist_quietly();
            }
            AccumulatorCommand::Append {
                chat_id,
                message_id,
                session,
                delta,
            } => {
                if !self.store.is_active(&chat_id, session) {
                    tracing::debug!(
                        "[ACCUMULATOR] Dropping delta from superseded session {}",
                        session.short()
                    );
                    return;
                }
                match self.store.append(&chat_id, &message_id, &delta) {
                    Ok(total_len) => self.emit(ChatEvent::Appended {
                        chat_id,
                        message_id,
                        delta,
                        total_len,
                    }),
                    Err(e) => tracing::warn!("[ACCUMULATOR] {}", e.inner),
                }
            }
            AccumulatorCommand::Finish {
                chat_id,
                message_id,
                session,
                outcome,
                response_time,
            } => self.finish(chat_id, message_id, session, outcome, response_time),
            AccumulatorCommand::AddMessage { chat_id, message } => {
                self.add_message(&chat_id, message);
                self.persist_quietly();
            }
            AccumulatorCommand::SetHistory {
                chat_id,
                newest_first,
            } => {
                let count = newest_first.len();
                self.store.set_history_newest_first(&chat_id, newest_first);
                self.emit(ChatEvent::HistoryLoaded { chat_id, count });
                self.persist_quietly();
            }
            AccumulatorCommand::SetCurrentChat { chat_id, title } => {
                if let Some(id) = &chat_id {
                    self.store.initialize_chat(id);
                }
                self.store.set_current_chat(chat_id, title);
                self.persist_quietly();
            }
            AccumulatorCommand::RemoveChat { chat_id, resp } => {
                let removed = self.store.remove_chat(&chat_id);
                self.persist_quietly();
                let _ = resp.send(removed);
            }
            AccumulatorCommand::GetMessages { chat_id, resp } => {
                let _ = resp.send(self.store.messages(&chat_id).to_vec());
            }
            AccumulatorCommand::GetMessage {
                chat_id,
                message_id,
                resp,
            } => {
                let _ = resp.send(self.store.message(&chat_id, &message_id).cloned());
            }
            AccumulatorCommand::GetChatState { chat_id, resp } => {
                let _ = resp.send(self.store.chat_state(&chat_id));
            }
            AccumulatorCommand::Snapshot { resp } => {
                let _ = resp.send(self.store.clone());
            }
            AccumulatorCommand::Persist { resp } => self.persist(Some(resp)),
        }
    }

    fn finish(
        &mut self,
        chat_id: ChatId,
        message_id: MessageId,
        session: SessionId,
        outcome: StreamOutcome,
        response_time: Option<ResponseTimeMs>,
    ) {
        self.store
            .finish_message(&chat_id, &message_id, response_time);

        // A superseded session only finalizes its own message; the chat state
        // belongs to the session that replaced it.
        if self.store.is_active(&chat_id, session) {
            self.store.active_sessions.remove(&chat_id);
            self.set_state(&chat_id, ChatState::Chatting);
        }

        tracing::info!(
            "[ACCUMULATOR] Stream {} finished: {:?}",
            session.short(),
            outcome
        );
        self.emit(ChatEvent::StreamFinished {
            chat_id,
            message_id,
            outcome,
            response_time,
        });
        self.persist_quietly();
    }

    fn add_message(&mut self, chat_id: &ChatId, message: Message) {
        let message_id = message.id.clone();
        let is_ai = message.is_ai;
        self.store.add_message(chat_id, message);
        self.emit(ChatEvent::MessageAdded {
            chat_id: chat_id.clone(),
            message_id,
            is_ai,
        });
    }

    fn set_state(&mut self, chat_id: &ChatId, state: ChatState) {
        if self.store.chat_state(chat_id) == state {
            return;
        }
        self.store.set_chat_state(chat_id, state);
        self.emit(ChatEvent::StateChanged {
            chat_id: chat_id.clone(),
            state,
        });
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.tx_events.send(event);
    }

    /// Queues a snapshot for the writer. `ack` resolves once it is on disk.
    fn persist(&self, ack: Option<oneshot::Sender<Result<()>>>) {
        let writer = match &self.writer {
            Some(w) => w,
            None => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                return;
            }
        };
        let raw = match serde_json::to_string(&self.store) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("[ACCUMULATOR] Failed to serialize chat store: {}", e);
                if let Some(ack) = ack {
                    let _ = ack.send(Err(e.into()));
                }
                return;
            }
        };
        if let Err(mpsc::error::SendError(job)) = writer.tx.send(PersistJob { raw, ack }) {
            if let Some(ack) = job.ack {
                let _ = ack.send(Err(AstryxError::Storage("persist writer stopped".to_string()).into()));
            }
        }
    }

    fn persist_quietly(&self) {
        self.persist(None);
    }
}

/// Cloneable sender side of the accumulator. Mutations are fire-and-forget so
/// they can be issued from synchronous stream callbacks.
#[derive(Clone)]
pub struct AccumulatorHandle {
    tx_cmd: mpsc::UnboundedSender<AccumulatorCommand>,
    tx_events: broadcast::Sender<ChatEvent>,
}

fn stopped<T>(_: T) -> ObservedError {
    AstryxError::internal("accumulator stopped").into()
}

impl AccumulatorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx_events.subscribe()
    }

    fn send(&self, cmd: AccumulatorCommand) -> Result<()> {
        self.tx_cmd.send(cmd).map_err(stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> AccumulatorCommand,
    ) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.send(build(resp))?;
        rx.await.map_err(stopped)
    }

    pub fn begin_session(
        &self,
        chat_id: &ChatId,
        session: SessionId,
        prompt: Message,
        placeholder: Message,
    ) -> Result<()> {
        self.send(AccumulatorCommand::BeginSession {
            chat_id: chat_id.clone(),
            session,
            prompt,
            placeholder,
        })
    }

    pub fn append(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        session: SessionId,
        delta: &str,
    ) -> Result<()> {
        self.send(AccumulatorCommand::Append {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
            session,
            delta: delta.to_string(),
        })
    }

    pub fn finish(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        session: SessionId,
        outcome: StreamOutcome,
        response_time: Option<ResponseTimeMs>,
    ) -> Result<()> {
        self.send(AccumulatorCommand::Finish {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
            session,
            outcome,
            response_time,
        })
    }

    pub fn add_message(&self, chat_id: &ChatId, message: Message) -> Result<()> {
        self.send(AccumulatorCommand::AddMessage {
            chat_id: chat_id.clone(),
            message,
        })
    }

    pub fn set_history(&self, chat_id: &ChatId, newest_first: Vec<Message>) -> Result<()> {
        self.send(AccumulatorCommand::SetHistory {
            chat_id: chat_id.clone(),
            newest_first,
        })
    }

    pub fn set_current_chat(&self, chat_id: Option<ChatId>, title: Option<String>) -> Result<()> {
        self.send(AccumulatorCommand::SetCurrentChat { chat_id, title })
    }

    pub async fn remove_chat(&self, chat_id: &ChatId) -> Result<bool> {
        let chat_id = chat_id.clone();
        self.request(|resp| AccumulatorCommand::RemoveChat { chat_id, resp })
            .await
    }

    pub async fn messages(&self, chat_id: &ChatId) -> Result<Vec<Message>> {
        let chat_id = chat_id.clone();
        self.request(|resp| AccumulatorCommand::GetMessages { chat_id, resp })
            .await
    }

    pub async fn message(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<Option<Message>> {
        let chat_id = chat_id.clone();
        let message_id = message_id.clone();
        self.request(|resp| AccumulatorCommand::GetMessage {
            chat_id,
            message_id,
            resp,
        })
        .await
    }

    pub async fn chat_state(&self, chat_id: &ChatId) -> Result<ChatState> {
        let chat_id = chat_id.clone();
        self.request(|resp| AccumulatorCommand::GetChatState { chat_id, resp })
            .await
    }

    pub async fn snapshot(&self) -> Result<ChatStore> {
        self.request(|resp| AccumulatorCommand::Snapshot { resp })
            .await
    }

    pub async fn persist(&self) -> Result<()> {
        self.request(|resp| AccumulatorCommand::Persist { resp })
            .await?
    }
}

/// Starts the accumulator task. The task ends, persisting one last time,
/// once every `AccumulatorHandle` clone has been dropped.
pub fn spawn_accumulator(
    store: ChatStore,
    persistence: Option<Arc<dyn KeyValueStore>>,
) -> (AccumulatorHandle, JoinHandle<ChatStore>) {
    let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
    let (tx_events, _) = broadcast::channel(1024);
    let accumulator = Accumulator::new(store, persistence, tx_events.clone(), rx_cmd);
    let task = tokio::spawn(accumulator.run());
    (AccumulatorHandle { tx_cmd, tx_events }, task)
}
