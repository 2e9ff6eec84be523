//! Kernel wiring: constructs every service in dependency order and exposes
//! a single `start`/`stop` pair for the `djr3x` binary to drive.
//!
//! Construction order follows the dependency chain between components:
//! bus -> lifecycle (no runtime state of its own) -> event schemas
//! (compile-time) -> memory -> mode manager -> debug -> cached speech ->
//! music controller -> timeline executor -> dj mode -> command dispatcher.
//! Each service after memory depends on something constructed before it in
//! this list.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::EventBus;
use crate::cached_speech::CachedSpeechService;
use crate::config::KernelConfig;
use crate::debug_service::DebugService;
use crate::dispatcher::CommandDispatcher;
use crate::dj_mode::DjModeService;
use crate::errors::KernelError;
use crate::events::payloads::LogLevel;
use crate::memory::MemoryService;
use crate::mode_manager::ModeManager;
use crate::music::{MusicController, StubMusicController};
use crate::service::ServiceRunner;
use crate::timeline::TimelineExecutor;

/// The stub `MusicController`'s starting playlist. A hardware- or
/// streaming-backed implementation would replace this with a real library
/// scan; actual audio playback is out of scope.
const DEFAULT_PLAYLIST: &[&str] = &["Cantina Band", "Mad About Me", "Huttuk Cheeta"];

fn parse_log_level(level: &str) -> LogLevel {
    match level.to_uppercase().as_str() {
        "DEBUG" => LogLevel::Debug,
        "WARNING" | "WARN" => LogLevel::Warning,
        "ERROR" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

/// Every constructed service plus the `ServiceRunner` that drives its
/// lifecycle. Held together so `start`/`stop` can sequence the whole kernel
/// with one call each.
pub struct Kernel {
    pub bus: Arc<EventBus>,
    pub memory: Arc<MemoryService>,
    pub mode_manager: Arc<ModeManager>,
    pub debug: Arc<DebugService>,
    pub cached_speech: Arc<CachedSpeechService>,
    pub music: Arc<dyn MusicController>,
    pub timeline: Arc<TimelineExecutor>,
    pub dj_mode: Arc<DjModeService>,
    pub dispatcher: Arc<CommandDispatcher>,

    memory_runner: ServiceRunner<MemoryService>,
    mode_manager_runner: ServiceRunner<ModeManager>,
    debug_runner: ServiceRunner<DebugService>,
    cached_speech_runner: ServiceRunner<CachedSpeechService>,
    music_runner: ServiceRunner<StubMusicController>,
    timeline_runner: ServiceRunner<TimelineExecutor>,
    dj_mode_runner: ServiceRunner<DjModeService>,
    dispatcher_runner: ServiceRunner<CommandDispatcher>,
}

impl Kernel {
    pub fn new(config: &KernelConfig) -> Arc<Self> {
        let bus = EventBus::new(Duration::from_secs(config.timeouts.handler_timeout_secs));
        let memory = MemoryService::new(bus.clone(), config);
        let mode_manager = ModeManager::new(bus.clone(), memory.clone());
        let debug = DebugService::new(parse_log_level(&config.log_level));
        let cached_speech = CachedSpeechService::new(config.cache.clone());
        let music = StubMusicController::new(DEFAULT_PLAYLIST.iter().map(|s| s.to_string()).collect());
        let timeline = TimelineExecutor::new(
            bus.clone(),
            memory.clone(),
            music.clone(),
            config.ducking.clone(),
            config.timeouts.clone(),
        );
        let dj_mode = DjModeService::new(memory.clone(), music.clone());
        let dispatcher = CommandDispatcher::new(memory.clone());

        let stop_timeout = Duration::from_secs(config.timeouts.stop_timeout_secs);
        let memory_runner = ServiceRunner::new(memory.clone(), bus.clone(), stop_timeout);
        let mode_manager_runner = ServiceRunner::new(mode_manager.clone(), bus.clone(), stop_timeout);
        let debug_runner = ServiceRunner::new(debug.clone(), bus.clone(), stop_timeout);
        let cached_speech_runner = ServiceRunner::new(cached_speech.clone(), bus.clone(), stop_timeout);
        let music_runner = ServiceRunner::new(music.clone(), bus.clone(), stop_timeout);
        let timeline_runner = ServiceRunner::new(timeline.clone(), bus.clone(), stop_timeout);
        let dj_mode_runner = ServiceRunner::new(dj_mode.clone(), bus.clone(), stop_timeout);
        let dispatcher_runner = ServiceRunner::new(dispatcher.clone(), bus.clone(), stop_timeout);

        Arc::new(Self {
            bus,
            memory,
            mode_manager,
            debug,
            cached_speech,
            music,
            timeline,
            dj_mode,
            dispatcher,
            memory_runner,
            mode_manager_runner,
            debug_runner,
            cached_speech_runner,
            music_runner,
            timeline_runner,
            dj_mode_runner,
            dispatcher_runner,
        })
    }

    /// Start every service. `CommandDispatcher` goes first even though it's
    /// last in the construction order: it subscribes to `register/command`,
    /// and `ModeManager`/`DebugService`/`StubMusicController` each announce
    /// their CLI patterns via that topic from inside their own `on_start`.
    /// Starting the dispatcher after them would mean those announcements
    /// fire before anyone is listening. `MemoryService` goes next, ahead of
    /// `ModeManager`, matching the dependency order C5 -> C4: `ModeManager`
    /// doesn't call into the bus-exposed `memory/get`/`memory/set` handlers,
    /// but nothing should observe memory as live before its own handlers
    /// are registered. `DjModeService` starts last: its patterns are
    /// built-ins on the dispatcher rather than self-announced, so it has
    /// no ordering requirement against the others beyond `memory`/`music`
    /// already existing, which construction order guarantees. A failure
    /// aborts the whole sequence; already-started services are left
    /// running for the caller to tear down via `stop`.
    pub async fn start(&self) -> Result<(), KernelError> {
        tracing::info!("starting kernel services");
        self.dispatcher_runner.start().await?;
        self.memory_runner.start().await?;
        self.mode_manager_runner.start().await?;
        self.debug_runner.start().await?;
        self.cached_speech_runner.start().await?;
        self.music_runner.start().await?;
        self.timeline_runner.start().await?;
        self.dj_mode_runner.start().await?;
        tracing::info!("kernel running");
        Ok(())
    }

    /// Stop every service in reverse start order.
    pub async fn stop(&self) -> Result<(), KernelError> {
        tracing::info!("stopping kernel services");
        self.dj_mode_runner.stop().await?;
        self.timeline_runner.stop().await?;
        self.music_runner.stop().await?;
        self.cached_speech_runner.stop().await?;
        self.debug_runner.stop().await?;
        self.mode_manager_runner.stop().await?;
        self.memory_runner.stop().await?;
        self.dispatcher_runner.stop().await?;
        tracing::info!("kernel stopped");
        Ok(())
    }
}
