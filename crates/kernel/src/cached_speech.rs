//! CachedSpeechService: an LRU+TTL cache of pre-rendered TTS audio that
//! short-circuits the legacy generate-then-speak round trip for lines the
//! robot says often.
//!
//! Grounded on
//! `examples/original_source/cantina_os/cantina_os/services/cached_speech_service.py`:
//! a cache hit on `speech_cache/request` answers immediately with
//! `speech_cache/ready`; a miss falls through to the same `tts/generate_request`
//! / `tts/audio_data` round trip the legacy `Speak` step uses, then populates
//! the cache for next time. `speech_cache/playback_request` is the
//! `TimelineExecutor`'s entry point for actually playing a cached entry and
//! always echoes the request's `playback_id` back on `speech_cache/playback_completed`.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

use crate::config::CacheConfig;
use crate::errors::KernelError;
use crate::events::{payloads::*, from_payload, to_payload, topic};
use crate::service::{Service, ServiceHandle};

#[derive(Debug, Clone)]
struct CacheEntry {
    audio_bytes: Vec<u8>,
    sample_rate: u32,
    duration_ms: u64,
    created_at: Instant,
    last_access: Instant,
    metadata: std::collections::BTreeMap<String, serde_json::Value>,
}

impl CacheEntry {
    fn size_bytes(&self) -> u64 {
        self.audio_bytes.len() as u64
    }
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Most-recently-used key at the back; used for capacity eviction.
    order: VecDeque<String>,
}

impl CacheState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key.clone(), entry);
        self.touch(&key);
    }

    fn total_size_bytes(&self) -> u64 {
        self.entries.values().map(CacheEntry::size_bytes).sum()
    }

    /// Evict least-recently-used entries until under both the entry-count and
    /// size caps.
    fn evict_to_fit(&mut self, max_entries: usize, max_size_bytes: u64) {
        while self.entries.len() > max_entries || self.total_size_bytes() > max_size_bytes {
            let Some(lru_key) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&lru_key);
        }
    }

    fn evict_older_than(&mut self, ttl: Duration, now: Instant) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.created_at) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.entries.remove(&key);
            if let Some(pos) = self.order.iter().position(|k| k == &key) {
                self.order.remove(pos);
            }
        }
    }
}

type GenerationWaiters = Mutex<HashMap<String, oneshot::Sender<Result<(Vec<u8>, u32), String>>>>;

pub struct CachedSpeechService {
    config: CacheConfig,
    state: Mutex<CacheState>,
    /// Pending `tts/generate_request` round trips, keyed by `cache_key` (the
    /// original only ever has one in flight per key; a second request for the
    /// same key while one is pending joins the same waiter).
    generation_waiters: GenerationWaiters,
}

impl CachedSpeechService {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(CacheState::new()),
            generation_waiters: Mutex::new(HashMap::new()),
        })
    }

    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_access = Instant::now();
            let entry = entry.clone();
            state.touch(key);
            Some(entry)
        } else {
            None
        }
    }

    async fn store(&self, key: String, audio_bytes: Vec<u8>, sample_rate: u32, duration_ms: u64) {
        let entry = CacheEntry {
            audio_bytes,
            sample_rate,
            duration_ms,
            created_at: Instant::now(),
            last_access: Instant::now(),
            metadata: Default::default(),
        };
        let mut state = self.state.lock().await;
        state.insert(key, entry);
        state.evict_to_fit(self.config.max_cache_entries, self.config.max_cache_size_mb * 1024 * 1024);
    }

    async fn handle_request(self: &Arc<Self>, bus: &Arc<crate::bus::EventBus>, request: SpeechCacheRequestPayload) {
        if let Some(entry) = self.lookup(&request.cache_key).await {
            let ready = SpeechCacheReadyPayload {
                cache_key: request.cache_key,
                duration_ms: entry.duration_ms,
                size_bytes: entry.size_bytes(),
                metadata: entry.metadata,
            };
            bus.emit(topic::SPEECH_CACHE_READY, to_payload(&ready)).await;
            return;
        }

        match self.generate(bus, &request.cache_key, &request.text).await {
            Ok((audio_bytes, sample_rate)) => {
                let duration_ms = estimate_duration_ms(&audio_bytes, sample_rate);
                self.store(request.cache_key.clone(), audio_bytes.clone(), sample_rate, duration_ms)
                    .await;
                let ready = SpeechCacheReadyPayload {
                    cache_key: request.cache_key,
                    duration_ms,
                    size_bytes: audio_bytes.len() as u64,
                    metadata: request.metadata,
                };
                bus.emit(topic::SPEECH_CACHE_READY, to_payload(&ready)).await;
            }
            Err(message) => {
                let error = SpeechCacheErrorPayload {
                    cache_key: request.cache_key,
                    error: message,
                };
                bus.emit(topic::SPEECH_CACHE_ERROR, to_payload(&error)).await;
            }
        }
    }

    /// Request generation via the legacy `tts/generate_request` / `tts/audio_data`
    /// round trip, correlated by `cache_key` rather than a dedicated id (the
    /// request payload carries none; see `DESIGN.md`).
    async fn generate(self: &Arc<Self>, bus: &Arc<crate::bus::EventBus>, cache_key: &str, text: &str) -> Result<(Vec<u8>, u32), String> {
        let (tx, rx) = oneshot::channel();
        self.generation_waiters.lock().await.insert(cache_key.to_string(), tx);

        let request = TtsGenerateRequestPayload {
            cache_key: Some(cache_key.to_string()),
            text: text.to_string(),
        };
        bus.emit(topic::TTS_GENERATE_REQUEST, to_payload(&request)).await;

        match tokio::time::timeout(Duration::from_secs(10), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("generation waiter dropped".to_string()),
            Err(_) => {
                self.generation_waiters.lock().await.remove(cache_key);
                Err("timed out waiting for tts/audio_data".to_string())
            }
        }
    }

    async fn handle_audio_data(&self, payload: TtsAudioDataPayload) {
        let Some(cache_key) = payload.cache_key.clone() else {
            return;
        };
        if let Some(tx) = self.generation_waiters.lock().await.remove(&cache_key) {
            let result = if payload.error.is_some() {
                Err(payload.error.unwrap_or_default())
            } else {
                Ok((payload.audio_bytes, payload.sample_rate))
            };
            let _ = tx.send(result);
        }
    }

    /// `playback_id` is always the request's own, never regenerated here —
    /// `TimelineExecutor` correlates its barrier on that exact value.
    async fn handle_playback_request(&self, bus: &Arc<crate::bus::EventBus>, request: SpeechCachePlaybackRequestPayload) {
        let Some(entry) = self.lookup(&request.cache_key).await else {
            let miss = SpeechCacheMissPayload {
                cache_key: request.cache_key,
                playback_id: request.playback_id,
            };
            bus.emit(topic::SPEECH_CACHE_MISS, to_payload(&miss)).await;
            return;
        };

        let started = SpeechCachePlaybackStartedPayload {
            cache_key: request.cache_key.clone(),
            playback_id: request.playback_id.clone(),
            duration_ms: entry.duration_ms,
            metadata: entry.metadata.clone(),
        };
        bus.emit(topic::SPEECH_CACHE_PLAYBACK_STARTED, to_payload(&started)).await;

        let bus = bus.clone();
        let duration = Duration::from_millis(entry.duration_ms);
        let cache_key = request.cache_key;
        let playback_id = request.playback_id;
        let metadata = entry.metadata;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let completed = SpeechCachePlaybackCompletedPayload {
                cache_key,
                playback_id,
                completion_status: CompletionStatus::Completed,
                metadata,
                error: None,
            };
            bus.emit(topic::SPEECH_CACHE_PLAYBACK_COMPLETED, to_payload(&completed)).await;
        });
    }

    async fn handle_cleanup(&self, bus: &Arc<crate::bus::EventBus>, cleanup: SpeechCacheCleanupPayload) {
        let mut state = self.state.lock().await;
        match cleanup {
            SpeechCacheCleanupPayload { keys: Some(keys), .. } => {
                for key in &keys {
                    state.entries.remove(key);
                    if let Some(pos) = state.order.iter().position(|k| k == key) {
                        state.order.remove(pos);
                    }
                }
            }
            SpeechCacheCleanupPayload { max_age_seconds: Some(secs), .. } => {
                state.evict_older_than(Duration::from_secs(secs), Instant::now());
            }
            _ => {
                state.entries.clear();
                state.order.clear();
            }
        }
        drop(state);
        let cleared = SpeechCacheClearedPayload {
            cache_key: None,
            success: true,
        };
        bus.emit(topic::SPEECH_CACHE_CLEARED, to_payload(&cleared)).await;
    }

    async fn run_periodic_cleanup(self: Arc<Self>, bus: Arc<crate::bus::EventBus>) {
        let interval = Duration::from_secs(self.config.cache_cleanup_interval_seconds.max(1));
        let ttl = Duration::from_secs(self.config.default_ttl_seconds);
        loop {
            tokio::time::sleep(interval).await;
            let mut state = self.state.lock().await;
            state.evict_older_than(ttl, Instant::now());
            drop(state);
            let cleared = SpeechCacheClearedPayload {
                cache_key: None,
                success: true,
            };
            bus.emit(topic::SPEECH_CACHE_CLEARED, to_payload(&cleared)).await;
        }
    }
}

fn estimate_duration_ms(audio_bytes: &[u8], sample_rate: u32) -> u64 {
    // 16-bit mono PCM assumed, matching the original's synthetic test fixtures.
    let bytes_per_ms = (sample_rate as u64 * 2) / 1000;
    if bytes_per_ms == 0 {
        0
    } else {
        audio_bytes.len() as u64 / bytes_per_ms
    }
}

#[async_trait]
impl Service for CachedSpeechService {
    fn name(&self) -> &str {
        "cached_speech"
    }

    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
        let this = self.clone();
        let bus = handle.bus().clone();
        handle.spawn(this.run_periodic_cleanup(bus)).await;

        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::SPEECH_CACHE_REQUEST,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let request: SpeechCacheRequestPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid speech_cache/request payload".to_string())?;
                        this.handle_request(&bus, request).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::SPEECH_CACHE_PLAYBACK_REQUEST,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let request: SpeechCachePlaybackRequestPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid speech_cache/playback_request payload".to_string())?;
                        this.handle_playback_request(&bus, request).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::SPEECH_CACHE_CLEANUP,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let cleanup: SpeechCacheCleanupPayload = from_payload(&payload).unwrap_or_default();
                        this.handle_cleanup(&bus, cleanup).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        handle
            .subscribe(
                topic::TTS_AUDIO_DATA,
                Arc::new(move |payload| {
                    let this = this.clone();
                    Box::pin(async move {
                        let data: TtsAudioDataPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid tts/audio_data payload".to_string())?;
                        this.handle_audio_data(data).await;
                        Ok(())
                    })
                }),
            )
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    fn test_config() -> CacheConfig {
        CacheConfig {
            max_cache_entries: 2,
            max_cache_size_mb: 100,
            default_ttl_seconds: 300,
            cache_cleanup_interval_seconds: 3600,
        }
    }

    #[tokio::test]
    async fn cache_hit_answers_without_generation_round_trip() {
        let service = CachedSpeechService::new(test_config());
        service.store("greeting".to_string(), vec![0u8; 32000], 16000, 1000).await;

        let bus = EventBus::new(Duration::from_secs(5));
        let ready_events = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let ready2 = ready_events.clone();
        bus.on(
            topic::SPEECH_CACHE_READY,
            "observer",
            Arc::new(move |payload| {
                let ready2 = ready2.clone();
                Box::pin(async move {
                    ready2.lock().await.push(payload);
                    Ok(())
                })
            }),
        );

        let request = SpeechCacheRequestPayload {
            cache_key: "greeting".to_string(),
            text: "hello there".to_string(),
            metadata: Default::default(),
        };
        service.handle_request(&bus, request).await;

        let ready = ready_events.lock().await;
        assert_eq!(ready.len(), 1);
    }

    #[tokio::test]
    async fn playback_request_echoes_playback_id_on_completion() {
        let service = CachedSpeechService::new(test_config());
        service.store("greeting".to_string(), vec![0u8; 1600], 16000, 10).await;

        let bus = EventBus::new(Duration::from_secs(5));
        let completed = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let completed2 = completed.clone();
        bus.on(
            topic::SPEECH_CACHE_PLAYBACK_COMPLETED,
            "observer",
            Arc::new(move |payload| {
                let completed2 = completed2.clone();
                Box::pin(async move {
                    completed2.lock().await.push(payload);
                    Ok(())
                })
            }),
        );

        let request = SpeechCachePlaybackRequestPayload {
            cache_key: "greeting".to_string(),
            playback_id: "pb-123".to_string(),
            volume: None,
            metadata: Default::default(),
        };
        service.handle_playback_request(&bus, request).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = completed.lock().await;
        assert_eq!(events.len(), 1);
        let payload: SpeechCachePlaybackCompletedPayload = serde_json::from_value(events[0].clone()).unwrap();
        assert_eq!(payload.playback_id, "pb-123");
        assert_eq!(payload.completion_status, CompletionStatus::Completed);
    }

    #[tokio::test]
    async fn playback_request_on_miss_emits_miss_event() {
        let service = CachedSpeechService::new(test_config());
        let bus = EventBus::new(Duration::from_secs(5));
        let misses = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let misses2 = misses.clone();
        bus.on(
            topic::SPEECH_CACHE_MISS,
            "observer",
            Arc::new(move |payload| {
                let misses2 = misses2.clone();
                Box::pin(async move {
                    misses2.lock().await.push(payload);
                    Ok(())
                })
            }),
        );

        let request = SpeechCachePlaybackRequestPayload {
            cache_key: "unknown".to_string(),
            playback_id: "pb-1".to_string(),
            volume: None,
            metadata: Default::default(),
        };
        service.handle_playback_request(&bus, request).await;

        assert_eq!(misses.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn capacity_eviction_drops_least_recently_used() {
        let service = CachedSpeechService::new(test_config());
        service.store("a".to_string(), vec![0u8; 100], 16000, 10).await;
        service.store("b".to_string(), vec![0u8; 100], 16000, 10).await;
        service.lookup("a").await; // touch a, making b the LRU
        service.store("c".to_string(), vec![0u8; 100], 16000, 10).await;

        let state = service.state.lock().await;
        assert!(!state.entries.contains_key("b"));
        assert!(state.entries.contains_key("a"));
        assert!(state.entries.contains_key("c"));
    }

    #[tokio::test]
    async fn cleanup_clear_all_empties_cache() {
        let service = CachedSpeechService::new(test_config());
        service.store("a".to_string(), vec![0u8; 100], 16000, 10).await;
        let bus = EventBus::new(Duration::from_secs(5));

        service.handle_cleanup(&bus, SpeechCacheCleanupPayload::default()).await;

        let state = service.state.lock().await;
        assert!(state.entries.is_empty());
    }
}
