use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Engine tunables. Every field has a default; unknown keys in the source
/// document are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
    #[serde(default = "default_beats_threshold")]
    pub beats_threshold: usize,
    #[serde(default = "default_words_per_beat")]
    pub words_per_beat: usize,
    #[serde(default = "default_archivist_cadence")]
    pub archivist_cadence: u32,
    #[serde(default = "default_rate_limit_default")]
    pub rate_limit_default: RateWindowConfig,
    #[serde(default = "default_rate_limit_expensive")]
    pub rate_limit_expensive: RateWindowConfig,
    #[serde(default = "default_evaluation_concurrency")]
    pub evaluation_concurrency: usize,
    #[serde(default = "default_prompt_cache_ttl_secs")]
    pub prompt_cache_ttl_secs: u64,
    #[serde(default = "default_graceful_shutdown_ms")]
    pub graceful_shutdown_ms: u64,
}

fn default_max_revisions() -> u32 {
    2
}
fn default_beats_threshold() -> usize {
    1000
}
fn default_words_per_beat() -> usize {
    500
}
fn default_archivist_cadence() -> u32 {
    3
}
fn default_rate_limit_default() -> RateWindowConfig {
    RateWindowConfig {
        window_secs: 60,
        max: 100,
    }
}
fn default_rate_limit_expensive() -> RateWindowConfig {
    RateWindowConfig {
        window_secs: 60,
        max: 10,
    }
}
fn default_evaluation_concurrency() -> usize {
    3
}
fn default_prompt_cache_ttl_secs() -> u64 {
    300
}
fn default_graceful_shutdown_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_revisions: default_max_revisions(),
            beats_threshold: default_beats_threshold(),
            words_per_beat: default_words_per_beat(),
            archivist_cadence: default_archivist_cadence(),
            rate_limit_default: default_rate_limit_default(),
            rate_limit_expensive: default_rate_limit_expensive(),
            evaluation_concurrency: default_evaluation_concurrency(),
            prompt_cache_ttl_secs: default_prompt_cache_ttl_secs(),
            graceful_shutdown_ms: default_graceful_shutdown_ms(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_ms)
    }

    pub fn prompt_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.prompt_cache_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// RateWindowConfig
// ---------------------------------------------------------------------------

/// One sliding-window tier of the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowConfig {
    pub window_secs: u64,
    pub max: u32,
}

impl RateWindowConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn window_ms(&self) -> u64 {
        self.window_secs * 1000
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_revisions, 2);
        assert_eq!(cfg.beats_threshold, 1000);
        assert_eq!(cfg.words_per_beat, 500);
        assert_eq!(cfg.archivist_cadence, 3);
        assert_eq!(cfg.rate_limit_default.max, 100);
        assert_eq!(cfg.rate_limit_expensive.max, 10);
        assert_eq!(cfg.evaluation_concurrency, 3);
        assert_eq!(cfg.prompt_cache_ttl_secs, 300);
        assert_eq!(cfg.graceful_shutdown_ms, 30_000);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg: EngineConfig =
            toml::from_str("max_revisions = 5\nnot_a_knob = \"ignored\"\n").unwrap();
        assert_eq!(cfg.max_revisions, 5);
        assert_eq!(cfg.beats_threshold, 1000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = EngineConfig::load_from("/nonexistent/storyforge.toml").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }
}
