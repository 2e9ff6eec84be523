//! Kernel configuration.
//!
//! Load order (later wins): compiled defaults, `./djr3x.toml` if present,
//! then `DJR3X_*` environment variables. A missing config file is not an
//! error; a malformed one is.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Cache sizing and eviction tunables for `CachedSpeechService`.
///
/// Defaults match `CachedSpeechServiceConfig` in the original Python
/// `cached_speech_service.py`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_cache_entries: usize,
    pub max_cache_size_mb: u64,
    pub default_ttl_seconds: u64,
    pub cache_cleanup_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: 10,
            max_cache_size_mb: 100,
            default_ttl_seconds: 300,
            cache_cleanup_interval_seconds: 60,
        }
    }
}

/// Ducking levels applied while cached speech or a legacy `Speak` step plays
/// over background music.
///
/// `default_level`/`fade_ms` are the legacy `Speak` step's own duck (matches
/// the original `timeline_executor_service.py`'s `_Config` defaults);
/// `cached_speech_level`/`cached_speech_fade_ms` is the stronger override
/// applied specifically around `PlayCachedSpeech` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuckingConfig {
    pub default_level: f32,
    pub fade_ms: u64,
    pub cached_speech_level: f32,
    pub cached_speech_fade_ms: u64,
    pub settle_ms: u64,
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            default_level: 0.3,
            fade_ms: 300,
            cached_speech_level: 0.5,
            cached_speech_fade_ms: 500,
            settle_ms: 150,
        }
    }
}

/// Timeouts for bus emits, plan barriers, and service lifecycle operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handler_timeout_secs: u64,
    pub speech_wait_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub subscription_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 5,
            speech_wait_timeout_secs: 10,
            stop_timeout_secs: 5,
            subscription_grace_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub memory_state_path: PathBuf,
    pub chat_history_max_turns: usize,
    pub max_recent_tracks: usize,
    pub cache: CacheConfig,
    pub ducking: DuckingConfig,
    pub timeouts: TimeoutConfig,
    pub log_level: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            memory_state_path: PathBuf::from("data/memory_state.json"),
            chat_history_max_turns: 10,
            max_recent_tracks: 5,
            cache: CacheConfig::default(),
            ducking: DuckingConfig::default(),
            timeouts: TimeoutConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl KernelConfig {
    /// Load configuration from `./djr3x.toml` (if present) and the
    /// environment, over compiled defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(std::path::Path::new("djr3x.toml"))
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })?;
            toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DJR3X_MEMORY_STATE_PATH") {
            self.memory_state_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DJR3X_CHAT_HISTORY_MAX_TURNS") {
            if let Ok(n) = v.parse() {
                self.chat_history_max_turns = n;
            }
        }
        if let Ok(v) = std::env::var("DJR3X_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("RUST_LOG") {
            self.log_level = v;
        }
    }
}
