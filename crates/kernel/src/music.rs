//! MusicController: background-music playback, crossfading, and the
//! ducking handshake `TimelineExecutor` leans on while speech plays over it.
//!
//! The actual audio device is out of scope — this is the in-process
//! stub the rest of the kernel talks to, grounded on
//! `examples/original_source/src/music_manager.py`'s event surface
//! (`track/playing`, `track/stopped`, ducking, crossfade) with the real
//! `pygame`/VLC playback calls replaced by in-memory state changes.
//! A hardware-backed implementation is a drop-in replacement behind the same
//! [`MusicController`] trait.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::KernelError;
use crate::events::{payloads::*, from_payload, to_payload, topic};
use crate::service::{Service, ServiceHandle};

/// The playback surface `TimelineExecutor` and `CommandDispatcher` depend on.
/// A real implementation would drive an actual audio backend; the [`StubMusicController`]
/// in this module tracks state in memory and emits the same events.
#[async_trait]
pub trait MusicController: Send + Sync {
    async fn play(&self, track: Option<String>) -> Result<String, KernelError>;
    async fn stop(&self) -> Result<(), KernelError>;
    async fn list(&self) -> Vec<String>;
    async fn crossfade(&self, track: String, duration_ms: u64) -> Result<(), KernelError>;
    async fn is_playing(&self) -> bool;
}

struct PlaylistState {
    tracks: Vec<String>,
    current_track: Option<String>,
    playing: bool,
}

pub struct StubMusicController {
    state: Mutex<PlaylistState>,
    ducked: AtomicBool,
}

/// Resolves a user-supplied track reference (index or name) against a
/// playlist. Unknown names pass through unchanged so a hardware backend
/// with a larger library than this stub's seed list still gets a sensible
/// track name to try. Shared with [`crate::dj_mode`]'s `dj queue` handler.
pub fn resolve_track(tracks: &[String], requested: Option<&str>) -> Option<String> {
    match requested {
        Some(name) => {
            if let Ok(index) = name.parse::<usize>() {
                if let Some(track) = index.checked_sub(1).and_then(|i| tracks.get(i)) {
                    return Some(track.clone());
                }
            }
            tracks
                .iter()
                .find(|t| t.eq_ignore_ascii_case(name) || t.as_str() == name)
                .cloned()
                .or_else(|| Some(name.to_string()))
        }
        None => tracks.first().cloned(),
    }
}

impl StubMusicController {
    pub fn new(tracks: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PlaylistState {
                tracks,
                current_track: None,
                playing: false,
            }),
            ducked: AtomicBool::new(false),
        })
    }

    async fn handle_command(self: &Arc<Self>, bus: &Arc<crate::bus::EventBus>, cmd: StandardizedCommandPayload) {
        let subcommand = cmd.subcommand.as_deref().unwrap_or_default();
        match subcommand {
            "music" if cmd.command == "play" => {
                let requested = cmd.args.first().map(String::as_str);
                match self.play(requested.map(str::to_string)).await {
                    Ok(track) => {
                        let playing = TrackPlayingPayload {
                            name: track.clone(),
                            metadata: Default::default(),
                        };
                        bus.emit(topic::TRACK_PLAYING, to_payload(&playing)).await;
                        self.respond(bus, false, format!("now playing '{track}'")).await;
                    }
                    Err(e) => self.respond(bus, true, e.to_string()).await,
                }
            }
            "music" if cmd.command == "stop" => {
                let _ = self.stop().await;
                crate::bus::emit_empty(bus, topic::TRACK_STOPPED).await;
                self.respond(bus, false, "music stopped").await;
            }
            "music" if cmd.command == "list" => {
                let tracks = self.list().await;
                self.respond(bus, false, format!("tracks: {}", tracks.join(", "))).await;
            }
            "music" if cmd.command == "crossfade" => {
                let (Some(track), Some(duration_str)) = (cmd.args.first(), cmd.args.get(1)) else {
                    self.respond(bus, true, "error: usage: crossfade music <track> <duration_ms> <crossfade_id>").await;
                    return;
                };
                let duration_ms: u64 = duration_str.parse().unwrap_or(3000);
                let crossfade_id = cmd.args.get(2).cloned().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

                if let Err(e) = self.crossfade(track.clone(), duration_ms).await {
                    self.respond(bus, true, e.to_string()).await;
                    return;
                }
                let playing = TrackPlayingPayload {
                    name: track.clone(),
                    metadata: Default::default(),
                };
                bus.emit(topic::TRACK_PLAYING, to_payload(&playing)).await;
                let complete = MusicCrossfadeCompletePayload { crossfade_id };
                bus.emit(topic::MUSIC_CROSSFADE_COMPLETE, to_payload(&complete)).await;
            }
            other => {
                self.respond(bus, true, format!("unknown music subcommand '{other}'")).await;
            }
        }
    }

    async fn respond(&self, bus: &Arc<crate::bus::EventBus>, is_error: bool, message: impl Into<String>) {
        let payload = CliResponsePayload {
            message: message.into(),
            is_error,
        };
        bus.emit(topic::CLI_RESPONSE, to_payload(&payload)).await;
    }

    async fn handle_ducking_start(&self, bus: &Arc<crate::bus::EventBus>, request: AudioDuckingStartPayload) {
        self.ducked.store(true, Ordering::SeqCst);
        let payload = serde_json::json!({ "level": request.level, "fade_ms": request.fade_ms });
        bus.emit(topic::MUSIC_VOLUME_DUCKED, payload).await;
    }

    async fn handle_ducking_stop(&self, bus: &Arc<crate::bus::EventBus>, request: AudioDuckingStopPayload) {
        self.ducked.store(false, Ordering::SeqCst);
        let payload = serde_json::json!({ "fade_ms": request.fade_ms });
        bus.emit(topic::MUSIC_VOLUME_RESTORED, payload).await;
    }
}

#[async_trait]
impl MusicController for StubMusicController {
    async fn play(&self, track: Option<String>) -> Result<String, KernelError> {
        let mut state = self.state.lock().await;
        let resolved = resolve_track(&state.tracks, track.as_deref())
            .ok_or_else(|| KernelError::ExternalProviderError {
                provider: "music_controller".to_string(),
                message: "playlist is empty".to_string(),
            })?;
        state.current_track = Some(resolved.clone());
        state.playing = true;
        Ok(resolved)
    }

    async fn stop(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock().await;
        state.playing = false;
        Ok(())
    }

    async fn list(&self) -> Vec<String> {
        self.state.lock().await.tracks.clone()
    }

    async fn crossfade(&self, track: String, _duration_ms: u64) -> Result<(), KernelError> {
        let mut state = self.state.lock().await;
        let resolved = resolve_track(&state.tracks, Some(&track)).unwrap_or(track);
        state.current_track = Some(resolved);
        state.playing = true;
        Ok(())
    }

    async fn is_playing(&self) -> bool {
        self.state.lock().await.playing
    }
}

#[async_trait]
impl Service for StubMusicController {
    fn name(&self) -> &str {
        "music_controller"
    }

    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
        for pattern in ["play music", "stop music", "list music", "crossfade music"] {
            let registration = RegisterCommandPayload {
                command: pattern.to_string(),
                handler_service: "music_controller".to_string(),
                event_topic: topic::MUSIC_COMMAND.to_string(),
            };
            handle.emit(topic::REGISTER_COMMAND, to_payload(&registration)).await;
        }

        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::MUSIC_COMMAND,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let cmd: StandardizedCommandPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid music/command payload".to_string())?;
                        this.handle_command(&bus, cmd).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::AUDIO_DUCKING_START,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let request: AudioDuckingStartPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid audio/ducking/start payload".to_string())?;
                        this.handle_ducking_start(&bus, request).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::AUDIO_DUCKING_STOP,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let request: AudioDuckingStopPayload = from_payload(&payload)
                            .ok_or_else(|| "invalid audio/ducking/stop payload".to_string())?;
                        this.handle_ducking_stop(&bus, request).await;
                        Ok(())
                    })
                }),
            )
            .await;

        Ok(())
    }
}
