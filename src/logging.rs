use crate::redaction::RedactingWriter;
use std::panic;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

const DEFAULT_FILTER: &str = "astryx=info";
const LOG_FILE_NAME: &str = "astryx.log";

/// Installs the global subscriber: a compact stderr layer, a daily-rolling
/// NDJSON file under `log_dir` (tokens redacted), and the span-trace layer
/// that `ObservedError` captures from.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_tracing(log_dir: &Path, verbose: bool) -> std::io::Result<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) if verbose => "astryx=debug".into(),
        Err(_) => DEFAULT_FILTER.into(),
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(move || RedactingWriter::new(non_blocking.clone())),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    Ok(guard)
}

/// Sets up a global panic hook that records the panic through tracing before
/// the default hook prints it.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-stream counters, logged once when the stream ends.
#[derive(Debug, Default)]
pub struct StreamMetric {
    pub events: usize,
    pub deltas: usize,
    pub text_chars: usize,
    started: Option<std::time::Instant>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self {
            started: Some(std::time::Instant::now()),
            ..Self::default()
        }
    }

    pub fn record_event(&mut self) {
        self.events += 1;
    }

    pub fn record_delta(&mut self, delta: &str) {
        self.deltas += 1;
        self.text_chars += delta.chars().count();
    }

    pub fn log_summary(&self, outcome: &str) {
        let elapsed_ms = match self.started {
            Some(t) => t.elapsed().as_millis(),
            None => 0,
        };
        info!(
            "[STREAM END] Outcome: {} | Events: {} | Deltas: {} | Text: {} chars | {}ms",
            outcome, self.events, self.deltas, self.text_chars, elapsed_ms
        );
    }
}
