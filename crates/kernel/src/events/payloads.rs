//! Structured event payload records.
//!
//! Each payload is a named record with explicit optional/required fields
//! and a canonical `timestamp`, in place of untyped payload dicts. A payload
//! is converted to a plain keyed JSON map at the bus boundary via
//! `serde_json::to_value`; handlers that only care about a subset of
//! fields deserialize back into the specific payload type they expect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Severity of a `service/status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// `ServiceStatus` enumeration. Transitions are monotonic
/// forward except `Error -> Starting` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Initializing,
    Starting,
    Running,
    Degraded,
    Error,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusPayload {
    pub service: String,
    pub status: ServiceStatus,
    pub message: String,
    pub severity: Severity,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

/// `SystemMode` state machine. Initial state `Startup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemMode {
    Startup,
    Idle,
    Ambient,
    Interactive,
    Sleeping,
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SystemMode::Startup => "STARTUP",
            SystemMode::Idle => "IDLE",
            SystemMode::Ambient => "AMBIENT",
            SystemMode::Interactive => "INTERACTIVE",
            SystemMode::Sleeping => "SLEEPING",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SystemMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "STARTUP" => Ok(SystemMode::Startup),
            "IDLE" => Ok(SystemMode::Idle),
            "AMBIENT" => Ok(SystemMode::Ambient),
            "INTERACTIVE" => Ok(SystemMode::Interactive),
            "SLEEPING" => Ok(SystemMode::Sleeping),
            other => Err(format!("unknown system mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeTransitionPayload {
    pub old: SystemMode,
    pub new: SystemMode,
    pub status: TransitionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemModeChangePayload {
    pub old: SystemMode,
    pub new: SystemMode,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSetModeRequestPayload {
    pub mode: SystemMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliCommandPayload {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub raw_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizedCommandPayload {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub raw_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default = "now")]
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliResponsePayload {
    pub message: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterCommandPayload {
    pub command: String,
    pub handler_service: String,
    pub event_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUpdatedPayload {
    pub key: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGetPayload {
    pub key: String,
    pub callback_topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySetPayload {
    pub key: String,
    pub value: serde_json::Value,
}

/// Priority layer a `Plan` runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanLayer {
    Ambient,
    Foreground,
    Override,
}

impl PlanLayer {
    pub fn priority(self) -> u8 {
        match self {
            PlanLayer::Ambient => 0,
            PlanLayer::Foreground => 1,
            PlanLayer::Override => 2,
        }
    }
}

/// Terminal status reported on `plan/ended`. Closed to four values;
/// layer pause/resume is a separate pair of events
/// (`plan/paused` / `plan/resumed`) rather than a fifth status here — see
/// `DESIGN.md` for the rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Completed,
    Cancelled,
    Failed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStartedPayload {
    pub plan_id: String,
    pub layer: PlanLayer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReadyPayload {
    pub plan_id: String,
    pub step_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEndedPayload {
    pub plan_id: String,
    pub layer: PlanLayer,
    pub status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPausedPayload {
    pub plan_id: String,
    pub layer: PlanLayer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResumedPayload {
    pub plan_id: String,
    pub layer: PlanLayer,
}

/// `PlanStep` tagged union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStepKind {
    Delay { duration_ms: u64 },
    PlayCachedSpeech { cache_key: String, volume: Option<f32> },
    MusicCrossfade { next_track_id: String, crossfade_duration_ms: u64 },
    EyePattern { pattern_name: String },
    Speak { text: String },
    /// list/play/stop routed through `CommandDispatcher`;
    /// no completion barrier (confirmed only by a separately observed
    /// `track/playing`).
    PlayMusic { action: PlayMusicAction, track: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMusicAction {
    Play,
    Stop,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    #[serde(flatten)]
    pub kind: PlanStepKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub layer: PlanLayer,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutedPayload {
    pub plan_id: String,
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCacheRequestPayload {
    pub cache_key: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCacheReadyPayload {
    pub cache_key: String,
    pub duration_ms: u64,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCacheErrorPayload {
    pub cache_key: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCacheMissPayload {
    pub cache_key: String,
    pub playback_id: String,
}

/// Legacy TTS generation request. `cache_key` is `None`
/// for a plain `Speak` step; `CachedSpeechService` sets it when generating to
/// populate the cache so `tts/audio_data` can be correlated back to the
/// originating cache entry rather than a dedicated request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsGenerateRequestPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsAudioDataPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub audio_bytes: Vec<u8>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_sample_rate() -> u32 {
    16000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechGenerationCompletePayload {
    pub text: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCachePlaybackRequestPayload {
    pub cache_key: String,
    pub playback_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCachePlaybackStartedPayload {
    pub cache_key: String,
    pub playback_id: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCachePlaybackCompletedPayload {
    pub cache_key: String,
    pub playback_id: String,
    pub completion_status: CompletionStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechCacheCleanupPayload {
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub max_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechCacheClearedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDuckingStartPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<f32>,
    pub fade_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDuckingStopPayload {
    pub fade_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPlayingPayload {
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicCrossfadeCompletePayload {
    pub crossfade_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEndingSoonPayload {
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLogPayload {
    pub component: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjLookaheadCacheEntry {
    pub track_id: String,
    pub state: DjLookaheadState,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DjLookaheadState {
    Pending,
    Ready,
    Failed,
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjModeStartPayload {
    pub track_name: String,
    pub dj_mode_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjModeStopPayload {
    pub dj_mode_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjNextTrackSelectedPayload {
    pub track_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjTrackQueuedPayload {
    pub track_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceListeningStartedPayload {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceListeningStoppedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemShutdownRequestedPayload {
    pub reason: String,
    #[serde(default)]
    pub restart: bool,
}
