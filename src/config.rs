use crate::constants::*;
use crate::view::ExtractMode;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal client for the research chat assistant", long_about = None)]
pub struct Args {
    #[arg(long, env = "ASTRYX_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,
    /// Defaults to `<api-base-url>/chat/stream`.
    #[arg(long, env = "ASTRYX_STREAM_URL")]
    pub stream_url: Option<String>,
    #[arg(long, env = "ASTRYX_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,
    #[arg(long, env = "ASTRYX_USER_ID", default_value = "anonymous")]
    pub user_id: String,
    #[arg(long, default_value_t = DEFAULT_REVEAL_INTERVAL_MS)]
    pub reveal_interval_ms: u64,
    #[arg(long, default_value_t = REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value = ".astryx")]
    pub data_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub no_animation: bool,
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a prompt and stream the answer.
    Ask {
        query: String,
        /// Continue an existing chat instead of creating one.
        #[arg(long)]
        chat_id: Option<String>,
        /// Extract blocks from the full stream instead of the revealed text.
        #[arg(long, value_enum, default_value_t = ModeArg::Display)]
        extract: ModeArg,
    },
    /// Print a chat's history without animation.
    Replay {
        #[arg(long)]
        chat_id: Option<String>,
        /// Fetch history from the backend before printing.
        #[arg(long, default_value_t = false)]
        remote: bool,
    },
    Chats {
        #[command(subcommand)]
        action: ChatsAction,
    },
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
    /// Send a message to support.
    Support {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        issue: String,
    },
    Health,
    Theme {
        #[command(subcommand)]
        action: ThemeAction,
    },
    Tts {
        #[command(subcommand)]
        action: TtsAction,
    },
    Saved {
        #[command(subcommand)]
        action: SavedAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ChatsAction {
    List,
    Delete { chat_id: String },
}

#[derive(Subcommand, Debug)]
pub enum TasksAction {
    List {
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
    Show {
        task_id: String,
    },
    Delete {
        task_id: String,
    },
    Create {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        cron: String,
        #[arg(long, value_enum, default_value_t = EventArg::TimeBased)]
        event: EventArg,
    },
}

#[derive(Subcommand, Debug)]
pub enum ThemeAction {
    Show,
    Toggle,
}

#[derive(Subcommand, Debug)]
pub enum TtsAction {
    Show,
    Set {
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        rate: Option<f32>,
        #[arg(long)]
        pitch: Option<f32>,
        #[arg(long)]
        volume: Option<f32>,
    },
    Reset,
}

#[derive(Subcommand, Debug)]
pub enum SavedAction {
    List,
    Add {
        chat_id: String,
        #[arg(long)]
        title: Option<String>,
    },
    Remove {
        chat_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Display,
    Full,
}

impl From<ModeArg> for ExtractMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Display => ExtractMode::DisplayText,
            ModeArg::Full => ExtractMode::FullText,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    TimeBased,
    EventBased,
    TimeAndEvent,
    OneTime,
}

impl From<EventArg> for crate::api::EventType {
    fn from(event: EventArg) -> Self {
        match event {
            EventArg::TimeBased => Self::TimeBased,
            EventArg::EventBased => Self::EventBased,
            EventArg::TimeAndEvent => Self::TimeAndEvent,
            EventArg::OneTime => Self::OneTime,
        }
    }
}

impl Args {
    pub fn stream_url(&self) -> String {
        match &self.stream_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!("{}{}", self.api_base_url.trim_end_matches('/'), STREAM_PATH),
        }
    }

    pub fn reveal_interval(&self) -> Duration {
        Duration::from_millis(
            self.reveal_interval_ms
                .clamp(MIN_REVEAL_INTERVAL_MS, MAX_REVEAL_INTERVAL_MS),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
