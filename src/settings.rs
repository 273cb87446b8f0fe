//! Persisted client-side settings and the key/value store behind them.
#![allow(clippy::manual_unwrap_or_default)]

use crate::constants::*;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// String-valued persistence slot, one JSON document per key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        // Atomic replace.
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> ObservedError {
    AstryxError::Storage("memory store lock poisoned".to_string()).into()
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

/// Reads `key`, falling back to `T::default()` when the slot is empty or its
/// content no longer parses.
pub fn load_json<T>(store: &dyn KeyValueStore, key: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let raw = match store.get(key)? {
        Some(raw) => raw,
        None => return Ok(T::default()),
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!("[SETTINGS] Discarding unreadable '{}': {}", key, e);
            Ok(T::default())
        }
    }
}

pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// A value bound to its store slot; every update is written through.
pub struct Persisted<T> {
    key: &'static str,
    value: T,
    store: Arc<dyn KeyValueStore>,
}

impl<T> Persisted<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn load(store: Arc<dyn KeyValueStore>, key: &'static str) -> Result<Self> {
        let value = load_json(store.as_ref(), key)?;
        Ok(Self { key, value, store })
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn update<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let out = f(&mut self.value);
        save_json(self.store.as_ref(), self.key, &self.value)?;
        Ok(out)
    }
}

/// --- THEME ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Light => write!(f, "light"),
            Self::Dark => write!(f, "dark"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ThemeSettings {
    pub theme: Theme,
}

impl ThemeSettings {
    pub fn toggle(&mut self) -> Theme {
        self.theme = match self.theme {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        };
        self.theme
    }

    pub fn is_dark(&self) -> bool {
        self.theme == Theme::Dark
    }
}

/// --- TEXT TO SPEECH ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TtsSettings {
    #[serde(default)]
    pub voice_name: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            voice_name: Some(DEFAULT_TTS_VOICE.to_string()),
            rate: DEFAULT_TTS_RATE,
            pitch: DEFAULT_TTS_PITCH,
            volume: DEFAULT_TTS_VOLUME,
        }
    }
}

impl TtsSettings {
    pub fn set_voice(&mut self, voice: Option<String>) {
        self.voice_name = voice.filter(|v| !v.trim().is_empty());
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.rate = rate.clamp(0.1, 10.0);
    }

    pub fn set_pitch(&mut self, pitch: f32) {
        self.pitch = pitch.clamp(0.0, 2.0);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// --- SAVED CHATS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SavedChat {
    pub id: String,
    pub chat_id: ChatId,
    pub title: String,
    pub user_id: String,
    pub saved_at: DateTime<Utc>,
}

/// Bookmarked chats, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SavedChats {
    #[serde(default)]
    pub saved_chats: Vec<SavedChat>,
}

impl SavedChats {
    /// Returns false when the chat is already saved.
    pub fn save(&mut self, chat_id: &ChatId, title: &str, user_id: &str) -> bool {
        if self.is_saved(chat_id) {
            return false;
        }
        let now = Utc::now();
        self.saved_chats.insert(
            0,
            SavedChat {
                id: format!("saved-{}-{}", chat_id, now.timestamp_millis()),
                chat_id: chat_id.clone(),
                title: title.to_string(),
                user_id: user_id.to_string(),
                saved_at: now,
            },
        );
        true
    }

    pub fn remove(&mut self, chat_id: &ChatId) -> bool {
        let before = self.saved_chats.len();
        self.saved_chats.retain(|c| &c.chat_id != chat_id);
        before != self.saved_chats.len()
    }

    pub fn is_saved(&self, chat_id: &ChatId) -> bool {
        self.saved_chats.iter().any(|c| &c.chat_id == chat_id)
    }

    pub fn for_user<'a>(&'a self, user_id: &'a str) -> impl Iterator<Item = &'a SavedChat> + 'a {
        self.saved_chats.iter().filter(move |c| c.user_id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tts_values_are_clamped() {
        let mut tts = TtsSettings::default();
        tts.set_rate(50.0);
        tts.set_pitch(-1.0);
        tts.set_volume(1.5);
        assert_eq!(tts.rate, 10.0);
        assert_eq!(tts.pitch, 0.0);
        assert_eq!(tts.volume, 1.0);
        tts.set_voice(Some("  ".to_string()));
        assert_eq!(tts.voice_name, None);
        tts.reset();
        assert_eq!(tts, TtsSettings::default());
        assert_eq!(tts.voice_name.as_deref(), Some("Rishi"));
    }

    #[test]
    fn test_theme_toggle() {
        let mut theme = ThemeSettings::default();
        assert!(!theme.is_dark());
        assert_eq!(theme.toggle(), Theme::Dark);
        assert_eq!(theme.toggle(), Theme::Light);
    }

    #[test]
    fn test_saved_chats_no_duplicates_newest_first() {
        let mut saved = SavedChats::default();
        assert!(saved.save(&ChatId::from("a"), "A", "u1"));
        assert!(saved.save(&ChatId::from("b"), "B", "u1"));
        assert!(!saved.save(&ChatId::from("a"), "A again", "u1"));
        assert_eq!(saved.saved_chats.len(), 2);
        assert_eq!(saved.saved_chats[0].chat_id, ChatId::from("b"));
        assert!(saved.remove(&ChatId::from("a")));
        assert!(!saved.remove(&ChatId::from("a")));
        assert_eq!(saved.for_user("u2").count(), 0);
    }

    #[test]
    fn test_persisted_writes_through() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut theme = match Persisted::<ThemeSettings>::load(store.clone(), THEME_STORE_KEY) {
            Ok(t) => t,
            Err(e) => panic!("load failed: {}", e),
        };
        if let Err(e) = theme.update(|t| t.toggle()) {
            panic!("update failed: {}", e);
        }
        let reloaded = match Persisted::<ThemeSettings>::load(store, THEME_STORE_KEY) {
            Ok(t) => t,
            Err(e) => panic!("reload failed: {}", e),
        };
        assert!(reloaded.get().is_dark());
    }

    #[test]
    fn test_unreadable_slot_falls_back_to_default() {
        let store = MemoryStore::new();
        if let Err(e) = store.set(TTS_STORE_KEY, "{not json") {
            panic!("set failed: {}", e);
        }
        let tts: TtsSettings = match load_json(&store, TTS_STORE_KEY) {
            Ok(t) => t,
            Err(e) => panic!("load failed: {}", e),
        };
        assert_eq!(tts, TtsSettings::default());
    }
}
