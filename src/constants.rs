/// Opening marker of a chart block. A superset of the generic fence.
pub const CHART_FENCE_OPEN: &str = "```chart";

/// Opening and closing marker of a generic fenced block.
pub const FENCE: &str = "```";

/// Default pause between two revealed tokens.
pub const DEFAULT_REVEAL_INTERVAL_MS: u64 = 10;
pub const MIN_REVEAL_INTERVAL_MS: u64 = 1;
pub const MAX_REVEAL_INTERVAL_MS: u64 = 1000;

/// REST defaults
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";
pub const STREAM_PATH: &str = "/chat/stream";
pub const REQUEST_TIMEOUT_SECS: u64 = 60;
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Chat titles derived from the first prompt are cut to this many characters.
pub const CHAT_TITLE_MAX_CHARS: usize = 50;

/// Task listing defaults
pub const DEFAULT_TASK_PAGE: u32 = 1;
pub const DEFAULT_TASK_LIMIT: u32 = 10;

/// Transport framing limits
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_SSE_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Persisted store keys
pub const CHAT_STORE_KEY: &str = "chat-store";
pub const THEME_STORE_KEY: &str = "theme-storage";
pub const TTS_STORE_KEY: &str = "tts-settings-storage";
pub const SAVED_CHATS_KEY: &str = "saved-chats";

/// Default text-to-speech voice settings
pub const DEFAULT_TTS_VOICE: &str = "Rishi";
pub const DEFAULT_TTS_RATE: f32 = 1.2;
pub const DEFAULT_TTS_PITCH: f32 = 1.1;
pub const DEFAULT_TTS_VOLUME: f32 = 1.0;
