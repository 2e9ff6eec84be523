//! The closed event-topic enumeration.
//!
//! Topics are plain string constants, mirroring `event_topics.py`'s
//! `EventTopics` class in the original source — the bus is topic-addressed
//! by string, not by a closed Rust enum, because external-collaborator
//! services (STT/TTS/LLM, hardware adapters) emit and consume the same
//! strings without depending on this crate's types.

pub mod topic {
    // Service status
    pub const SERVICE_STATUS: &str = "service/status";

    // Mode
    pub const SYSTEM_SET_MODE_REQUEST: &str = "system/set_mode/request";
    pub const MODE_TRANSITION_STARTED: &str = "mode/transition/started";
    pub const MODE_TRANSITION_COMPLETE: &str = "mode/transition/complete";
    pub const MODE_TRANSITION_FAILED: &str = "mode/transition/failed";
    pub const SYSTEM_MODE_CHANGE: &str = "system/mode/change";

    // CLI
    pub const CLI_COMMAND: &str = "cli/command";
    pub const CLI_RESPONSE: &str = "cli/response";
    pub const REGISTER_COMMAND: &str = "register/command";

    // Transcription
    pub const TRANSCRIPTION_INTERIM: &str = "transcription/interim";
    pub const TRANSCRIPTION_FINAL: &str = "transcription/final";

    // Voice lifecycle
    pub const VOICE_LISTENING_STARTED: &str = "voice/listening/started";
    pub const VOICE_LISTENING_STOPPED: &str = "voice/listening/stopped";
    pub const VOICE_PROCESSING_STARTED: &str = "voice/processing/started";

    // LLM
    pub const LLM_RESPONSE: &str = "llm/response";
    pub const LLM_RESPONSE_CHUNK: &str = "llm/response/chunk";

    // TTS / legacy speak path
    pub const TTS_GENERATE_REQUEST: &str = "tts/generate_request";
    pub const TTS_AUDIO_DATA: &str = "tts/audio_data";
    pub const SPEECH_GENERATION_STARTED: &str = "speech/generation/started";
    pub const SPEECH_GENERATION_COMPLETE: &str = "speech/generation/complete";

    // Cached speech
    pub const SPEECH_CACHE_REQUEST: &str = "speech_cache/request";
    pub const SPEECH_CACHE_READY: &str = "speech_cache/ready";
    pub const SPEECH_CACHE_MISS: &str = "speech_cache/miss";
    pub const SPEECH_CACHE_ERROR: &str = "speech_cache/error";
    pub const SPEECH_CACHE_PLAYBACK_REQUEST: &str = "speech_cache/playback_request";
    pub const SPEECH_CACHE_PLAYBACK_STARTED: &str = "speech_cache/playback_started";
    pub const SPEECH_CACHE_PLAYBACK_COMPLETED: &str = "speech_cache/playback_completed";
    pub const SPEECH_CACHE_CLEANUP: &str = "speech_cache/cleanup";
    pub const SPEECH_CACHE_CLEARED: &str = "speech_cache/cleared";

    // Music
    pub const MUSIC_COMMAND: &str = "music/command";
    pub const TRACK_PLAYING: &str = "track/playing";
    pub const TRACK_STOPPED: &str = "track/stopped";
    pub const AUDIO_DUCKING_START: &str = "audio/ducking/start";
    pub const AUDIO_DUCKING_STOP: &str = "audio/ducking/stop";
    pub const MUSIC_VOLUME_DUCKED: &str = "music/volume/ducked";
    pub const MUSIC_VOLUME_RESTORED: &str = "music/volume/restored";
    pub const MUSIC_CROSSFADE_COMPLETE: &str = "music/crossfade_complete";
    pub const TRACK_ENDING_SOON: &str = "track/ending_soon";

    // LED
    pub const EYE_COMMAND: &str = "eye/command";

    // DJ mode
    pub const DJ_COMMAND: &str = "dj/command";
    pub const DJ_MODE_START: &str = "dj/mode/start";
    pub const DJ_MODE_STOP: &str = "dj/mode/stop";
    pub const DJ_NEXT_TRACK_SELECTED: &str = "dj/next_track_selected";
    pub const DJ_TRACK_QUEUED: &str = "dj/track/queued";

    // Plans
    pub const PLAN_READY: &str = "plan/ready";
    pub const PLAN_STARTED: &str = "plan/started";
    pub const STEP_READY: &str = "step/ready";
    pub const STEP_EXECUTED: &str = "step/executed";
    pub const PLAN_ENDED: &str = "plan/ended";
    /// Added beyond the closed `plan/ended` status set: see
    /// `DESIGN.md` for why layer-pause is its own event rather
    /// than a `plan/ended` status value.
    pub const PLAN_PAUSED: &str = "plan/paused";
    pub const PLAN_RESUMED: &str = "plan/resumed";

    // Memory
    pub const MEMORY_GET: &str = "memory/get";
    pub const MEMORY_SET: &str = "memory/set";
    pub const MEMORY_UPDATED: &str = "memory/updated";

    // Debug
    pub const DEBUG_LOG: &str = "debug/log";
    pub const DEBUG_COMMAND: &str = "debug/command";
    pub const DEBUG_COMMAND_TRACE: &str = "debug/command_trace";
    pub const DEBUG_PERFORMANCE: &str = "debug/performance";
    pub const DEBUG_STATE_TRANSITION: &str = "debug/state_transition";
    pub const DEBUG_CONFIG: &str = "debug/config";
    pub const DEBUG_SET_GLOBAL_LEVEL: &str = "debug/set_global_level";

    // Shutdown
    pub const SYSTEM_SHUTDOWN_REQUESTED: &str = "system/shutdown/requested";
}
