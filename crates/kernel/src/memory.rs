//! MemoryService: keyed working memory, chat-history ring, predicate
//! waits, JSON snapshot persistence.
//!
//! Grounded on
//! `examples/original_source/cantina_os/cantina_os/services/memory_service/memory_service.py`.
//! Two deliberate departures from that source, recorded in `DESIGN.md`:
//! - `append_chat` persists the snapshot like every other mutation (the
//!   original skips it, which breaks its own "saved after every mutation"
//!   contract).
//! - `wait_for` re-checks its predicate after every wake instead of
//!   returning unconditionally on the first notification (the original
//!   checks the predicate once, before waiting, then trusts the wake).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::errors::KernelError;
use crate::events::{payloads::*, from_payload, to_payload, topic};
use crate::service::{Service, ServiceHandle};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub music_playing: bool,
    #[serde(default)]
    pub current_track: Option<String>,
    #[serde(default)]
    pub last_intent: Option<Value>,
    #[serde(default)]
    pub chat_history: VecDeque<ChatMessage>,
    #[serde(default)]
    pub dj_mode_active: bool,
    #[serde(default)]
    pub dj_track_history: VecDeque<String>,
    #[serde(default)]
    pub dj_next_track: Option<String>,
    #[serde(default)]
    pub dj_transition_style: Option<String>,
    #[serde(default)]
    pub dj_user_preferences: BTreeMap<String, Value>,
    #[serde(default)]
    pub dj_lookahead_cache: Option<DjLookaheadCacheEntry>,
}

impl MemoryState {
    fn get(&self, key: &str) -> Option<Value> {
        match key {
            "mode" => Some(serde_json::to_value(&self.mode).unwrap()),
            "music_playing" => Some(Value::Bool(self.music_playing)),
            "current_track" => Some(serde_json::to_value(&self.current_track).unwrap()),
            "last_intent" => self.last_intent.clone(),
            "chat_history" => Some(serde_json::to_value(&self.chat_history).unwrap()),
            "dj_mode_active" => Some(Value::Bool(self.dj_mode_active)),
            "dj_track_history" => Some(serde_json::to_value(&self.dj_track_history).unwrap()),
            "dj_next_track" => Some(serde_json::to_value(&self.dj_next_track).unwrap()),
            "dj_transition_style" => Some(serde_json::to_value(&self.dj_transition_style).unwrap()),
            "dj_user_preferences" => Some(serde_json::to_value(&self.dj_user_preferences).unwrap()),
            "dj_lookahead_cache" => Some(serde_json::to_value(&self.dj_lookahead_cache).unwrap()),
            _ => None,
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Result<Value, KernelError> {
        let old = self.get(key).unwrap_or(Value::Null);
        macro_rules! apply {
            ($field:expr) => {
                $field = serde_json::from_value(value)
                    .map_err(|e| KernelError::DispatchInvalidPayload(e.to_string()))?
            };
        }
        match key {
            "mode" => apply!(self.mode),
            "music_playing" => apply!(self.music_playing),
            "current_track" => apply!(self.current_track),
            "last_intent" => self.last_intent = Some(value),
            "chat_history" => apply!(self.chat_history),
            "dj_mode_active" => apply!(self.dj_mode_active),
            "dj_track_history" => apply!(self.dj_track_history),
            "dj_next_track" => apply!(self.dj_next_track),
            "dj_transition_style" => apply!(self.dj_transition_style),
            "dj_user_preferences" => apply!(self.dj_user_preferences),
            "dj_lookahead_cache" => apply!(self.dj_lookahead_cache),
            other => return Err(KernelError::DispatchInvalidPayload(format!("unknown memory key '{other}'"))),
        }
        Ok(old)
    }
}

pub struct MemoryService {
    bus: Arc<crate::bus::EventBus>,
    state: Mutex<MemoryState>,
    notify: Notify,
    persist_path: PathBuf,
    chat_history_max_turns: usize,
    max_recent_tracks: usize,
}

impl MemoryService {
    pub fn new(bus: Arc<crate::bus::EventBus>, config: &crate::config::KernelConfig) -> Arc<Self> {
        let state = Self::load_from_disk(&config.memory_state_path).unwrap_or_default();
        Arc::new(Self {
            bus,
            state: Mutex::new(state),
            notify: Notify::new(),
            persist_path: config.memory_state_path.clone(),
            chat_history_max_turns: config.chat_history_max_turns,
            max_recent_tracks: config.max_recent_tracks,
        })
    }

    fn load_from_disk(path: &PathBuf) -> Option<MemoryState> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse memory snapshot, using defaults");
                None
            }
        }
    }

    async fn persist(&self, state: &MemoryState) {
        if let Some(parent) = self.persist_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, "failed to create memory snapshot directory");
                return;
            }
        }
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.persist_path, json).await {
                    tracing::warn!(error = %e, path = %self.persist_path.display(), "failed to persist memory snapshot");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize memory snapshot"),
        }
    }

    /// `set(key, value)`: updates, persists, emits `memory/updated`, wakes waiters.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), KernelError> {
        let (old, snapshot) = {
            let mut state = self.state.lock().await;
            let old = state.set(key, value.clone())?;
            (old, state.clone())
        };
        self.persist(&snapshot).await;
        let payload = MemoryUpdatedPayload {
            key: key.to_string(),
            old_value: old,
            new_value: value,
        };
        self.bus.emit(topic::MEMORY_UPDATED, to_payload(&payload)).await;
        self.notify.notify_waiters();
        Ok(())
    }

    /// `get(key, default?)`: synchronous (w.r.t. the caller's own lock
    /// scope) read of the in-memory map.
    pub async fn get(&self, key: &str, default: Option<Value>) -> Option<Value> {
        let state = self.state.lock().await;
        state.get(key).or(default)
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// `append_chat(message)`: appends, trims to `chat_history_max_turns`,
    /// emits update. Persists, unlike the Python source (see module docs).
    pub async fn append_chat(&self, message: ChatMessage) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.chat_history.push_back(message);
            while state.chat_history.len() > self.chat_history_max_turns {
                state.chat_history.pop_front();
            }
            state.clone()
        };
        self.persist(&snapshot).await;
        let payload = MemoryUpdatedPayload {
            key: "chat_history".to_string(),
            old_value: Value::Null,
            new_value: serde_json::to_value(&snapshot.chat_history).unwrap(),
        };
        self.bus.emit(topic::MEMORY_UPDATED, to_payload(&payload)).await;
        self.notify.notify_waiters();
    }

    /// Suspend until `predicate(state)` becomes true or `timeout` elapses.
    /// Returns `true` on success. Re-checks the predicate after every wake
    /// rather than trusting the first notification.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Option<Duration>) -> bool
    where
        F: Fn(&MemoryState) -> bool,
    {
        let wait = async {
            loop {
                // The notified future must exist before the predicate check:
                // `Notify` only delivers wakes to futures that existed at
                // `notify_waiters()` time, so checking first and
                // constructing the future after would miss a `set()` that
                // lands in between.
                let notified = self.notify.notified();
                if predicate(&*self.state.lock().await) {
                    return;
                }
                notified.await;
            }
        };
        match timeout {
            Some(d) => tokio::time::timeout(d, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    pub async fn set_user_preference(&self, key: &str, value: Value) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.dj_user_preferences.insert(key.to_string(), value);
            state.clone()
        };
        self.persist(&snapshot).await;
        self.notify.notify_waiters();
    }

    pub async fn get_user_preference(&self, key: &str, default: Option<Value>) -> Option<Value> {
        let state = self.state.lock().await;
        state.dj_user_preferences.get(key).cloned().or(default)
    }

    pub async fn set_lookahead_cache_state(&self, entry: DjLookaheadCacheEntry) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.dj_lookahead_cache = Some(entry);
            state.clone()
        };
        self.persist(&snapshot).await;
        self.notify.notify_waiters();
    }

    pub async fn get_lookahead_cache_state(&self) -> Option<DjLookaheadCacheEntry> {
        self.state.lock().await.dj_lookahead_cache.clone()
    }

    pub async fn clear_lookahead_cache_state(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.dj_lookahead_cache = None;
            state.clone()
        };
        self.persist(&snapshot).await;
        self.notify.notify_waiters();
    }

    /// Record a newly-queued DJ track, capping history and avoiding the
    /// last `max_recent_tracks` selections for next-track selection.
    pub async fn push_dj_track_history(&self, track_id: String) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.dj_track_history.push_back(track_id);
            while state.dj_track_history.len() > 20 {
                state.dj_track_history.pop_front();
            }
            state.clone()
        };
        self.persist(&snapshot).await;
        self.notify.notify_waiters();
    }

    pub async fn recent_track_history(&self, n: usize) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .dj_track_history
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    pub fn max_recent_tracks(&self) -> usize {
        self.max_recent_tracks
    }

    /// Replace the entire state map with defaults, persist, and wake
    /// waiters. Backs the CLI `reset` command.
    pub async fn reset_to_defaults(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            *state = MemoryState::default();
            state.clone()
        };
        self.persist(&snapshot).await;
        let payload = MemoryUpdatedPayload {
            key: "*".to_string(),
            old_value: Value::Null,
            new_value: serde_json::to_value(&snapshot).unwrap(),
        };
        self.bus.emit(topic::MEMORY_UPDATED, to_payload(&payload)).await;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Service for MemoryService {
    fn name(&self) -> &str {
        "memory"
    }

    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
        let this = self.clone();
        handle
            .subscribe(
                topic::MEMORY_GET,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        let req: MemoryGetPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid memory/get payload".to_string())?;
                        let value = this.get(&req.key, None).await.unwrap_or(Value::Null);
                        this.bus.emit(req.callback_topic, value).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::MEMORY_SET,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        let req: MemorySetPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid memory/set payload".to_string())?;
                        this.set(&req.key, req.value)
                            .await
                            .map_err(|e| e.to_string())
                    })
                }),
            )
            .await;

        Ok(())
    }
}
