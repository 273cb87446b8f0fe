use astryx::accumulator::{spawn_accumulator, AccumulatorHandle, ChatEvent, ChatStore};
use astryx::extract::extract_segments;
use astryx::session::ChatController;
use astryx::streaming::{ByteStream, StreamOutcome, StreamRequest, StreamTransport};
use astryx::view::{drive_view, ExtractMode, MessageView, ViewOptions};
use astryx::*;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Replays fixed chunks as the response body.
struct ScriptedTransport {
    chunks: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
        }
    }
}

impl StreamTransport for ScriptedTransport {
    fn open(&self, _request: &StreamRequest) -> BoxFuture<'static, Result<ByteStream>> {
        let items: Vec<std::io::Result<Bytes>> =
            self.chunks.iter().map(|c| Ok(Bytes::from(c.clone()))).collect();
        Box::pin(async move { Ok(Box::pin(futures_util::stream::iter(items)) as ByteStream) })
    }
}

/// Hands out a body fed chunk by chunk from the test.
struct ChannelTransport {
    rx: Mutex<Option<mpsc::UnboundedReceiver<std::io::Result<Bytes>>>>,
}

impl StreamTransport for ChannelTransport {
    fn open(&self, _request: &StreamRequest) -> BoxFuture<'static, Result<ByteStream>> {
        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        Box::pin(async move {
            let rx = match rx {
                Some(rx) => rx,
                None => return Err(AstryxError::internal("body already taken").into()),
            };
            let body = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(Box::pin(body) as ByteStream)
        })
    }
}

fn sse(payload: &str) -> String {
    format!("data: {}\n\n", payload)
}

async fn next_event(rx: &mut broadcast::Receiver<ChatEvent>) -> ChatEvent {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Ok(event)) => event,
        Ok(Err(e)) => panic!("event feed failed: {}", e),
        Err(_) => panic!("timed out waiting for an event"),
    }
}

async fn wait_finished(rx: &mut broadcast::Receiver<ChatEvent>) -> StreamOutcome {
    loop {
        if let ChatEvent::StreamFinished { outcome, .. } = next_event(rx).await {
            return outcome;
        }
    }
}

async fn content_of(handle: &AccumulatorHandle, chat: &ChatId, message: &MessageId) -> Message {
    match handle.message(chat, message).await {
        Ok(Some(m)) => m,
        Ok(None) => panic!("message {} missing", message),
        Err(e) => panic!("lookup failed: {}", e),
    }
}

fn controller_with(transport: Arc<dyn StreamTransport>) -> (ChatController, AccumulatorHandle) {
    let (handle, _task) = spawn_accumulator(ChatStore::new(), None);
    let controller = ChatController::new(transport, handle.clone(), UserId::from("u1".to_string()));
    (controller, handle)
}

const CHART_EVENT: &str = r#"{"text":"the chart:\n```chart\n{\"type\":\"bar-standard\",\"data\":[{\"q\":1,\"rev\":5}],\"dataKey\":\"rev\",\"title\":\"T\"}\n```"}"#;

#[tokio::test]
async fn test_stream_to_segments_end_to_end() {
    let transport = Arc::new(ScriptedTransport::new(&[
        &sse(r#"{"text":"Here is "}"#),
        &sse(CHART_EVENT),
        &sse(r#"{"end":true}"#),
    ]));
    let (mut controller, handle) = controller_with(transport);
    let chat = ChatId::from("chat-1");
    let mut events = handle.subscribe();

    let ticket = match controller.submit_prompt(&chat, "Show revenue") {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {}", e),
    };
    assert_eq!(wait_finished(&mut events).await, StreamOutcome::Completed);
    assert_eq!(controller.wait(&chat).await, Some(StreamOutcome::Completed));

    let message = content_of(&handle, &chat, &ticket.message_id).await;
    assert!(message.response_time.is_some());

    let extraction = extract_segments(&message.content, true);
    assert!(extraction.failures.is_empty());
    assert_eq!(extraction.segments.len(), 2);
    assert_eq!(
        extraction.segments[0],
        ContentSegment::markdown("Here is the chart:")
    );
    match &extraction.segments[1] {
        ContentSegment::Chart { payload } => {
            assert_eq!(payload.kind, "bar-standard");
            assert_eq!(payload.data_key, "rev");
            assert_eq!(payload.title.as_deref(), Some("T"));
            assert_eq!(payload.data.len(), 1);
            assert_eq!(payload.data[0].get("rev"), Some(&serde_json::json!(5)));
        }
        other => panic!("expected a chart, got {:?}", other),
    }

    match handle.chat_state(&chat).await {
        Ok(state) => assert_eq!(state, ChatState::Chatting),
        Err(e) => panic!("state lookup failed: {}", e),
    }
}

#[tokio::test]
async fn test_malformed_chart_stays_markdown() {
    let block = "```chart\nnot json\n```";
    let payload = serde_json::json!({ "text": block }).to_string();
    let transport = Arc::new(ScriptedTransport::new(&[
        &sse(&payload),
        &sse(r#"{"end":true}"#),
    ]));
    let (mut controller, handle) = controller_with(transport);
    let chat = ChatId::from("chat-2");
    let mut events = handle.subscribe();

    let ticket = match controller.submit_prompt(&chat, "chart please") {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {}", e),
    };
    assert_eq!(wait_finished(&mut events).await, StreamOutcome::Completed);

    let message = content_of(&handle, &chat, &ticket.message_id).await;
    let extraction = extract_segments(&message.content, true);
    assert_eq!(extraction.segments, vec![ContentSegment::markdown(block)]);
    assert_eq!(extraction.failures.len(), 1);
}

#[tokio::test]
async fn test_abort_keeps_partial_content() {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ChannelTransport {
        rx: Mutex::new(Some(rx)),
    });
    let (mut controller, handle) = controller_with(transport);
    let chat = ChatId::from("chat-3");
    let mut events = handle.subscribe();

    let ticket = match controller.submit_prompt(&chat, "long answer") {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {}", e),
    };

    let mut appended = 0;
    for delta in ["First ", "second "] {
        let _ = tx.send(Ok(Bytes::from(sse(&serde_json::json!({ "text": delta }).to_string()))));
        loop {
            if let ChatEvent::Appended { .. } = next_event(&mut events).await {
                appended += 1;
                break;
            }
        }
    }
    assert_eq!(appended, 2);
    assert!(controller.is_streaming(&chat));

    assert!(controller.abort(&chat));
    assert_eq!(wait_finished(&mut events).await, StreamOutcome::Aborted);
    let _ = tx.send(Ok(Bytes::from(sse(r#"{"text":"third"}"#))));
    tokio::time::sleep(Duration::from_millis(50)).await;

    loop {
        match events.try_recv() {
            Ok(ChatEvent::Appended { delta, .. }) => panic!("delta after abort: {}", delta),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    let message = content_of(&handle, &chat, &ticket.message_id).await;
    assert_eq!(message.content, "First second ");
    assert!(message.response_time.is_none());
    assert!(!controller.is_streaming(&chat));
}

#[tokio::test]
async fn test_new_prompt_supersedes_running_stream() {
    let (tx, rx) = mpsc::unbounded_channel::<std::io::Result<Bytes>>();
    let transport = Arc::new(ChannelTransport {
        rx: Mutex::new(Some(rx)),
    });
    let (mut controller, handle) = controller_with(transport);
    let chat = ChatId::from("chat-4");
    let mut events = handle.subscribe();

    let first = match controller.submit_prompt(&chat, "first") {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {}", e),
    };
    let second = match controller.submit_prompt(&chat, "second") {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {}", e),
    };
    assert_ne!(first.session_id, second.session_id);
    let _ = tx.send(Ok(Bytes::from(sse(r#"{"text":"late"}"#))));
    drop(tx);

    let mut outcomes = Vec::new();
    while outcomes.len() < 2 {
        if let ChatEvent::StreamFinished {
            message_id, outcome, ..
        } = next_event(&mut events).await
        {
            outcomes.push((message_id, outcome));
        }
    }
    assert!(outcomes.contains(&(first.message_id.clone(), StreamOutcome::Aborted)));

    let stale = content_of(&handle, &chat, &first.message_id).await;
    assert_eq!(stale.content, "");
}

#[tokio::test]
async fn test_multibyte_split_across_chunks() {
    let event = sse(r#"{"text":"Café ☕"}"#);
    let bytes = event.as_bytes();
    let split = match event.find('é') {
        Some(i) => i + 1,
        None => panic!("no accent in fixture"),
    };
    let transport = Arc::new(ScriptedTransport {
        chunks: vec![
            bytes[..split].to_vec(),
            bytes[split..].to_vec(),
            sse(r#"{"end":true}"#).into_bytes(),
        ],
    });
    let (mut controller, handle) = controller_with(transport);
    let chat = ChatId::from("chat-5");
    let mut events = handle.subscribe();

    let ticket = match controller.submit_prompt(&chat, "coffee") {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {}", e),
    };
    assert_eq!(wait_finished(&mut events).await, StreamOutcome::Completed);
    let message = content_of(&handle, &chat, &ticket.message_id).await;
    assert_eq!(message.content, "Café ☕");
}

#[tokio::test]
async fn test_empty_prompt_is_rejected() {
    let transport = Arc::new(ScriptedTransport::new(&[]));
    let (mut controller, _handle) = controller_with(transport);
    assert!(controller.submit_prompt(&ChatId::from("c"), "   ").is_err());
}

#[tokio::test(start_paused = true)]
async fn test_view_reveals_and_reports_panel_once() {
    let text = format!(
        "Revenue grew.\n{}",
        "```chart\n{\"type\":\"line\",\"data\":[{\"m\":\"Jan\",\"v\":1},{\"m\":\"Feb\",\"v\":2}],\"dataKey\":\"v\"}\n```"
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ChannelTransport {
        rx: Mutex::new(Some(rx)),
    });
    let (mut controller, handle) = controller_with(transport);
    let chat = ChatId::from("chat-6");
    let events = handle.subscribe();

    let ticket = match controller.submit_prompt(&chat, "trend") {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {}", e),
    };
    let _ = tx.send(Ok(Bytes::from(sse(
        &serde_json::json!({ "text": text }).to_string(),
    ))));
    let _ = tx.send(Ok(Bytes::from(sse(r#"{"end":true}"#))));

    let view = MessageView::streaming(
        chat.clone(),
        ticket.message_id.clone(),
        ViewOptions {
            animate: true,
            mode: ExtractMode::DisplayText,
        },
    );
    let cancel = CancellationToken::new();
    let mut patches = 0;
    let mut lengths = Vec::new();
    let view = match drive_view(
        view,
        &handle,
        events,
        Duration::from_millis(10),
        &cancel,
        |v, update| {
            lengths.push(v.display_text().len());
            if update.panel_patch.is_some() {
                patches += 1;
            }
        },
    )
    .await
    {
        Ok(v) => v,
        Err(e) => panic!("view failed: {}", e),
    };

    assert!(view.is_settled());
    assert_eq!(view.display_text(), text);
    assert_eq!(patches, 1);
    assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(view.extraction().charts().count(), 1);
    assert_eq!(
        view.segments()[0],
        ContentSegment::markdown("Revenue grew.")
    );
}

#[tokio::test]
async fn test_cancelled_view_stops_early() {
    let (handle, _task) = spawn_accumulator(ChatStore::new(), None);
    let chat = ChatId::from("chat-7");
    let message = Message::ai_placeholder();
    let id = message.id.clone();
    if let Err(e) = handle.add_message(&chat, message) {
        panic!("add failed: {}", e);
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    let view = MessageView::streaming(chat, id, ViewOptions::default());
    let result = drive_view(
        view,
        &handle,
        handle.subscribe(),
        Duration::from_millis(10),
        &cancel,
        |_, _| {},
    )
    .await;
    match result {
        Ok(v) => assert!(v.display_text().is_empty()),
        Err(e) => panic!("view failed: {}", e),
    }
}
