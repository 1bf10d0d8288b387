//! Typed configuration surface for the runtime.
//!
//! Mirrors the recognized configuration options from the external-interfaces
//! design: one struct per concern (download, VAD, STT, LLM, TTS), aggregated
//! into a single [`Config`] root that round-trips through TOML the same way
//! `saorsa-labs-fae`'s `SpeechConfig` does.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root configuration, aggregating every subsystem's options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub vad: VadConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
}

impl Config {
    /// Load a config from a TOML file, falling back to defaults if the file
    /// does not exist. A malformed file is a hard error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| RuntimeError::io_with_path(e, path))?;
        toml::from_str(&contents).map_err(RuntimeError::from)
    }

    /// Serialize this config to TOML and write it to `path`.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self).map_err(|e| RuntimeError::Config {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RuntimeError::io_with_path(e, parent))?;
        }
        std::fs::write(path, contents).map_err(|e| RuntimeError::io_with_path(e, path))
    }
}

/// Priority tiers for download tasks. Ordered `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_concurrent_downloads: usize,
    pub retry_count: u32,
    pub retry_delay_seconds: f64,
    pub timeout_seconds: u64,
    pub chunk_size_bytes: usize,
    pub verify_checksum: bool,
    /// Jitter is off by default so that the retry-determinism testable
    /// property (elapsed time >= sum of documented backoff delays) holds
    /// exactly; enable it for production deployments hitting a shared origin.
    pub retry_jitter: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            retry_count: 3,
            retry_delay_seconds: 1.0,
            timeout_seconds: 300,
            chunk_size_bytes: 1024 * 1024,
            verify_checksum: true,
            retry_jitter: false,
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadConfig {
    /// Fixed at 16000 per the canonical voice audio chunk format.
    pub sample_rate: u32,
    pub frame_length_seconds: f64,
    pub energy_threshold: f32,
    /// Lower "content present" threshold used to confirm that a nominally
    /// silent frame is not actually low-level speech trailing off.
    pub content_present_threshold: f32,
    pub min_speech_duration_seconds: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_length_seconds: 0.1,
            energy_threshold: 0.025,
            content_present_threshold: 0.005,
            min_speech_duration_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SttConfig {
    pub model_id: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_id: None,
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    pub voice: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    pub language: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
            language: None,
        }
    }
}

/// Fixed, non-overridable runtime constants (mirrors the teacher's
/// `NetworkConfig`/`PathsConfig`-style constant groups).
pub struct RuntimeConstants;

impl RuntimeConstants {
    pub const MODELS_DIR_NAME: &'static str = "Models";
    pub const CACHE_DIR_NAME: &'static str = "cache";
    pub const TEMP_PREFIX: &'static str = "runanywhere_temp_";
    pub const RESUME_BLOB_PREFIX: &'static str = "resume_";
    pub const DOWNLOAD_PROGRESS_CHUNK_BYTES: u64 = 1024 * 1024;
    pub const STT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const LLM_STAGE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const TTS_STAGE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(60);
    pub const VOICE_FLUSH_INTERVAL_NO_VAD: Duration = Duration::from_secs(2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn from_file_missing_returns_default() {
        let config = Config::from_file("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn from_file_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.llm.model_id = Some("qwen-2.5-0.5b".into());
        config.download.max_concurrent_downloads = 5;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn download_priority_orders_critical_highest() {
        assert!(DownloadPriority::Critical > DownloadPriority::High);
        assert!(DownloadPriority::High > DownloadPriority::Normal);
        assert!(DownloadPriority::Normal > DownloadPriority::Low);
    }

    #[test]
    fn vad_defaults_match_the_documented_thresholds() {
        let vad = VadConfig::default();
        assert_eq!(vad.sample_rate, 16_000);
        assert!((vad.energy_threshold - 0.025).abs() < f32::EPSILON);
        assert!((vad.content_present_threshold - 0.005).abs() < f32::EPSILON);
        assert_eq!(vad.min_speech_duration_seconds, 1.0);
    }
}
