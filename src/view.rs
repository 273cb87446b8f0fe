#![allow(clippy::manual_unwrap_or_default)]
use crate::accumulator::{AccumulatorHandle, ChatEvent};
use crate::extract::{self, Extraction};
use crate::panel::PanelPatch;
use crate::reveal::RevealScheduler;
use crate::types::*;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Which text the extractor scans while a message is still revealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractMode {
    /// The revealed prefix: blocks appear once the reveal reaches them.
    #[default]
    DisplayText,
    /// The accumulated text: blocks appear as soon as the stream closes them.
    FullText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewOptions {
    pub animate: bool,
    pub mode: ExtractMode,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            animate: true,
            mode: ExtractMode::DisplayText,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewUpdate {
    pub changed: bool,
    /// Structured content to hand to the side panel. Set at most once per
    /// message, on the transition to complete.
    pub panel_patch: Option<PanelPatch>,
}

impl ViewUpdate {
    pub fn is_noop(&self) -> bool {
        !self.changed && self.panel_patch.is_none()
    }
}

/// Render pipeline of one message: reveal (or pass-through) feeding the block
/// extractor.
#[derive(Debug, Clone)]
pub struct MessageView {
    chat_id: ChatId,
    message_id: MessageId,
    mode: ExtractMode,
    reveal: RevealScheduler,
    structured_charts: Vec<ChartSpec>,
    extraction: Extraction,
    reported: bool,
}

impl MessageView {
    /// View of a message that is about to stream in.
    pub fn streaming(chat_id: ChatId, message_id: MessageId, options: ViewOptions) -> Self {
        Self {
            chat_id,
            message_id,
            mode: options.mode,
            reveal: RevealScheduler::new(options.animate),
            structured_charts: Vec::new(),
            extraction: Extraction::default(),
            reported: false,
        }
    }

    /// View of a message whose content is final. History messages never
    /// animate.
    pub fn settled(chat_id: ChatId, message: &Message, options: ViewOptions) -> (Self, ViewUpdate) {
        let animate = options.animate && message.is_new_message;
        let mut view = Self::streaming(
            chat_id,
            message.id.clone(),
            ViewOptions { animate, ..options },
        );
        let update = view.finish(message);
        (view, update)
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn is_for(&self, chat_id: &ChatId, message_id: &MessageId) -> bool {
        &self.chat_id == chat_id && &self.message_id == message_id
    }

    pub fn display_text(&self) -> &str {
        self.reveal.display_text()
    }

    pub fn segments(&self) -> &[ContentSegment] {
        &self.extraction.segments
    }

    pub fn extraction(&self) -> &Extraction {
        &self.extraction
    }

    pub fn is_settled(&self) -> bool {
        self.reveal.is_cancelled() || (self.reveal.is_complete() && self.reported)
    }

    /// Applies one appended delta. `total_len` is the content length after
    /// the append; deltas already covered are ignored. Returns `None` on a
    /// gap, in which case the caller must `resync`.
    pub fn push_delta(&mut self, delta: &str, total_len: usize) -> Option<ViewUpdate> {
        let have = self.reveal.source().len();
        if total_len <= have {
            return Some(ViewUpdate::default());
        }
        if total_len.checked_sub(delta.len()) != Some(have) {
            return None;
        }
        self.reveal.extend(delta);
        Some(self.refresh())
    }

    pub fn resync(&mut self, content: &str) -> ViewUpdate {
        let finished = self.reveal.source_finished();
        self.reveal.observe(content, finished);
        self.refresh()
    }

    /// Takes the final message: its content ends the source and its
    /// structured charts are appended once the reveal completes.
    pub fn finish(&mut self, message: &Message) -> ViewUpdate {
        self.structured_charts = message.structured_charts.clone();
        self.reveal.observe(&message.content, true);
        self.refresh()
    }

    /// Ends the source with whatever has been received.
    pub fn finish_source(&mut self) -> ViewUpdate {
        self.reveal.finish_source();
        self.refresh()
    }

    pub fn tick(&mut self) -> ViewUpdate {
        if self.reveal.tick() {
            self.refresh()
        } else {
            ViewUpdate::default()
        }
    }

    pub fn skip(&mut self) -> ViewUpdate {
        self.reveal.skip();
        self.refresh()
    }

    pub fn cancel(&mut self) {
        self.reveal.cancel();
    }

    fn refresh(&mut self) -> ViewUpdate {
        let (text, complete) = match self.mode {
            ExtractMode::DisplayText => (self.reveal.display_text(), self.reveal.is_complete()),
            ExtractMode::FullText => (self.reveal.source(), self.reveal.source_finished()),
        };

        let mut extraction = extract::extract_segments(text, complete);
        if complete {
            for chart in &self.structured_charts {
                extraction.segments.push(ContentSegment::Chart {
                    payload: extract::normalize_chart(chart.clone()),
                });
            }
            for failure in &extraction.failures {
                tracing::debug!(
                    message_id = %self.message_id,
                    "[VIEW] Chart block at {} rendered as text: {}",
                    failure.offset,
                    failure.reason
                );
            }
        }

        let mut panel_patch = None;
        if complete && !self.reported {
            self.reported = true;
            let code = extraction.code_blocks().map(str::to_string).collect();
            let charts = extraction.charts().cloned().collect();
            let patch = PanelPatch::from_content(code, charts);
            if !patch.is_empty() {
                tracing::debug!(message_id = %self.message_id, "[VIEW] Reporting structured content");
                panel_patch = Some(patch);
            }
        }

        let changed = extraction != self.extraction;
        self.extraction = extraction;
        ViewUpdate {
            changed,
            panel_patch,
        }
    }
}

/// Drives a view with a reveal timer and the accumulator's event feed until
/// it settles or `cancel` fires.
///
/// Subscribe `events` before the stream starts so no delta is missed; deltas
/// that predate the initial snapshot are skipped by length.
pub async fn drive_view<F>(
    mut view: MessageView,
    accumulator: &AccumulatorHandle,
    mut events: broadcast::Receiver<ChatEvent>,
    interval: Duration,
    cancel: &CancellationToken,
    mut on_update: F,
) -> Result<MessageView>
where
    F: FnMut(&MessageView, &ViewUpdate),
{
    let initial = resync(&mut view, accumulator).await?;
    if !initial.is_noop() {
        on_update(&view, &initial);
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    while !view.is_settled() {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                view.cancel();
                break;
            }
            event = events.recv(), if events_open => match event {
                Ok(ChatEvent::Appended { chat_id, message_id, delta, total_len })
                    if view.is_for(&chat_id, &message_id) =>
                {
                    match view.push_delta(&delta, total_len) {
                        Some(u) => u,
                        None => resync(&mut view, accumulator).await?,
                    }
                }
                Ok(ChatEvent::StreamFinished { chat_id, message_id, .. })
                    if view.is_for(&chat_id, &message_id) =>
                {
                    match accumulator.message(&chat_id, &message_id).await? {
                        Some(m) => view.finish(&m),
                        None => view.finish_source(),
                    }
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("[VIEW] Event feed lagged by {}; resyncing", skipped);
                    resync(&mut view, accumulator).await?
                }
                Err(RecvError::Closed) => {
                    events_open = false;
                    view.finish_source()
                }
            },
            _ = ticker.tick() => view.tick(),
        };

        if !update.is_noop() {
            on_update(&view, &update);
        }
    }

    Ok(view)
}

async fn resync(view: &mut MessageView, accumulator: &AccumulatorHandle) -> Result<ViewUpdate> {
    let message = accumulator
        .message(view.chat_id(), view.message_id())
        .await?;
    Ok(match message {
        Some(m) => view.resync(&m.content),
        None => ViewUpdate::default(),
    })
}
