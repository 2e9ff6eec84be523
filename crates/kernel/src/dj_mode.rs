//! DjModeService: autonomous "DJ mode" track selection — activates and
//! deactivates on command, picks the next track while steering clear of
//! recent repeats, and lets a user queue a specific track ahead of the
//! next automatic pick.
//!
//! Grounded on
//! `examples/original_source/cantina_os/cantina_os/services/brain_service.py`'s
//! `_handle_dj_mode_changed`/`_handle_dj_next_track`/`_smart_track_selection`:
//! recent-history filtering with a reset-and-retry fallback when every
//! track has been played recently, carried over unchanged; the Python
//! source's `random.choice` becomes `rand::seq::SliceRandom::choose` here.
//! `dj queue`, which that source doesn't implement, is grounded on
//! `spec.md` §6's `dj/track/queued` topic and the CLI surface's
//! `dj queue <n|name>` entry: it resolves a track the same way `play
//! music` does and stashes it in `MemoryState.dj_next_track`, which
//! `smart_track_selection` consults before falling back to history-aware
//! random choice.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;

use crate::errors::KernelError;
use crate::events::{payloads::*, from_payload, to_payload, topic};
use crate::memory::MemoryService;
use crate::music::{resolve_track, MusicController};
use crate::service::{Service, ServiceHandle};

pub struct DjModeService {
    memory: Arc<MemoryService>,
    music: Arc<dyn MusicController>,
}

impl DjModeService {
    pub fn new(memory: Arc<MemoryService>, music: Arc<dyn MusicController>) -> Arc<Self> {
        Arc::new(Self { memory, music })
    }

    /// A queued track (`dj queue`) always wins and is consumed on read.
    /// Otherwise picks a track absent from the last `max_recent_tracks`
    /// selections, resetting the history and retrying against the full
    /// library if every track has been played recently.
    async fn smart_track_selection(&self) -> Option<String> {
        if let Some(queued) = self
            .memory
            .get("dj_next_track", None)
            .await
            .and_then(|v| v.as_str().map(str::to_string))
        {
            let _ = self.memory.set("dj_next_track", Value::Null).await;
            return Some(queued);
        }

        let tracks = self.music.list().await;
        if tracks.is_empty() {
            return None;
        }

        let recent = self.memory.recent_track_history(self.memory.max_recent_tracks()).await;
        let mut available: Vec<&String> = tracks.iter().filter(|t| !recent.contains(t)).collect();
        if available.is_empty() {
            tracing::info!("all tracks played recently, resetting dj history");
            available = tracks.iter().collect();
        }
        available.choose(&mut rand::thread_rng()).map(|s| (*s).clone())
    }

    async fn handle_start(&self, bus: &Arc<crate::bus::EventBus>) {
        let Some(track_name) = self.smart_track_selection().await else {
            self.respond(bus, true, "no tracks available for dj mode").await;
            return;
        };
        let _ = self.memory.set("dj_mode_active", Value::Bool(true)).await;
        self.memory.push_dj_track_history(track_name.clone()).await;

        let payload = DjModeStartPayload {
            track_name,
            dj_mode_active: true,
        };
        bus.emit(topic::DJ_MODE_START, to_payload(&payload)).await;
    }

    async fn handle_stop(&self, bus: &Arc<crate::bus::EventBus>) {
        let _ = self.memory.set("dj_mode_active", Value::Bool(false)).await;
        let _ = self.memory.set("dj_track_history", Value::Array(Vec::new())).await;

        let payload = DjModeStopPayload { dj_mode_active: false };
        bus.emit(topic::DJ_MODE_STOP, to_payload(&payload)).await;
    }

    async fn handle_next(&self, bus: &Arc<crate::bus::EventBus>) {
        let active = self
            .memory
            .get("dj_mode_active", None)
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !active {
            self.respond(bus, true, "dj mode is not active").await;
            return;
        }

        let Some(track_name) = self.smart_track_selection().await else {
            self.respond(bus, true, "no tracks available for next selection").await;
            return;
        };
        self.memory.push_dj_track_history(track_name.clone()).await;

        let payload = DjNextTrackSelectedPayload { track_name };
        bus.emit(topic::DJ_NEXT_TRACK_SELECTED, to_payload(&payload)).await;
    }

    async fn handle_queue(&self, bus: &Arc<crate::bus::EventBus>, args: &[String]) {
        let requested = if args.is_empty() { None } else { Some(args.join(" ")) };
        let tracks = self.music.list().await;
        let Some(track_name) = resolve_track(&tracks, requested.as_deref()) else {
            self.respond(bus, true, "playlist is empty").await;
            return;
        };
        let _ = self.memory.set("dj_next_track", Value::String(track_name.clone())).await;

        let payload = DjTrackQueuedPayload { track_name };
        bus.emit(topic::DJ_TRACK_QUEUED, to_payload(&payload)).await;
    }

    async fn respond(&self, bus: &Arc<crate::bus::EventBus>, is_error: bool, message: impl Into<String>) {
        let payload = CliResponsePayload {
            message: message.into(),
            is_error,
        };
        bus.emit(topic::CLI_RESPONSE, to_payload(&payload)).await;
    }

    async fn handle_command(self: &Arc<Self>, bus: &Arc<crate::bus::EventBus>, cmd: StandardizedCommandPayload) {
        match cmd.subcommand.as_deref().unwrap_or_default() {
            "start" => self.handle_start(bus).await,
            "stop" => self.handle_stop(bus).await,
            "next" => self.handle_next(bus).await,
            "queue" => self.handle_queue(bus, &cmd.args).await,
            other => self.respond(bus, true, format!("unknown dj subcommand '{other}'")).await,
        }
    }
}

#[async_trait]
impl Service for DjModeService {
    fn name(&self) -> &str {
        "dj_mode"
    }

    async fn on_start(self: &Arc<Self>, handle: &ServiceHandle) -> Result<(), KernelError> {
        let this = self.clone();
        let bus = handle.bus().clone();
        handle
            .subscribe(
                topic::DJ_COMMAND,
                Arc::new(move |payload| {
                    let this = this.clone();
                    let bus = bus.clone();
                    Box::pin(async move {
                        let cmd: StandardizedCommandPayload =
                            from_payload(&payload).ok_or_else(|| "invalid dj/command payload".to_string())?;
                        this.handle_command(&bus, cmd).await;
                        Ok(())
                    })
                }),
            )
            .await;

        Ok(())
    }
}
