//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value parsed but is outside its accepted range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A native ffmpeg installation addressed by a version label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NativeBackendEntry {
    pub label: String,
    /// Path to the ffmpeg binary, or a bare name resolved through PATH
    pub path: PathBuf,
}

/// A container image carrying one ffmpeg version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerBackendEntry {
    pub label: String,
    pub image: String,
}

/// Backend discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Preferred version label
    #[serde(default = "default_backend_label")]
    pub default: String,
    /// Prefer a container image over a native binary when both are declared
    #[serde(default = "default_use_containers")]
    pub use_containers: bool,
    /// Labels tried after the preferred one, in order
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<String>,
    /// Timeout for the `-version` liveness query
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    /// Container runtime executable
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    #[serde(default = "default_native_backends")]
    pub native: Vec<NativeBackendEntry>,
    #[serde(default = "default_container_backends")]
    pub container: Vec<ContainerBackendEntry>,
}

fn default_backend_label() -> String {
    "5.1.6".to_string()
}

fn default_use_containers() -> bool {
    true
}

fn default_fallback_order() -> Vec<String> {
    ["8.0.0", "7.1.0", "5.1.6", "system", "homebrew"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_liveness_timeout_secs() -> u64 {
    5
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

fn default_native_backends() -> Vec<NativeBackendEntry> {
    let mut entries: Vec<NativeBackendEntry> = ["5.1.6", "7.1.0", "8.0.0"]
        .iter()
        .map(|v| NativeBackendEntry {
            label: v.to_string(),
            path: PathBuf::from(format!("/usr/local/ffmpeg-versions/{}/ffmpeg", v)),
        })
        .collect();
    entries.push(NativeBackendEntry {
        label: "system".to_string(),
        path: PathBuf::from("ffmpeg"),
    });
    entries.push(NativeBackendEntry {
        label: "homebrew".to_string(),
        path: PathBuf::from("/opt/homebrew/bin/ffmpeg"),
    });
    entries
}

fn default_container_backends() -> Vec<ContainerBackendEntry> {
    ["5.1.6", "7.1.0", "8.0.0"]
        .iter()
        .map(|v| ContainerBackendEntry {
            label: v.to_string(),
            image: format!("ffmpeg:{}", v),
        })
        .collect()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default: default_backend_label(),
            use_containers: default_use_containers(),
            fallback_order: default_fallback_order(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            container_runtime: default_container_runtime(),
            native: default_native_backends(),
            container: default_container_backends(),
        }
    }
}

/// Probe protocol tuning. The threshold and patterns are empirical and
/// tied to one ffmpeg output format, so they stay configurable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Timeout applied to each stage invocation
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Seconds of audio decoded by the decode-probe stage
    #[serde(default = "default_decode_probe_seconds")]
    pub decode_probe_seconds: u32,
    /// Format probe scores strictly below this raise a misdetection warning
    #[serde(default = "default_low_score_threshold")]
    pub low_score_threshold: u32,
    /// Format names preferred when ffmpeg reports a comma-separated list
    #[serde(default = "default_known_formats")]
    pub known_formats: Vec<String>,
    #[serde(default)]
    pub extra_truncation_patterns: Vec<String>,
    #[serde(default)]
    pub extra_header_patterns: Vec<String>,
}

fn default_stage_timeout_secs() -> u64 {
    60
}

fn default_decode_probe_seconds() -> u32 {
    30
}

fn default_low_score_threshold() -> u32 {
    25
}

fn default_known_formats() -> Vec<String> {
    ["flac", "mp3", "m4a", "ogg", "wav", "aac", "asf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            decode_probe_seconds: default_decode_probe_seconds(),
            low_score_threshold: default_low_score_threshold(),
            known_formats: default_known_formats(),
            extra_truncation_patterns: Vec::new(),
            extra_header_patterns: Vec::new(),
        }
    }
}

/// Batch worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchConfig {
    /// Worker pool size (0 = auto-derive)
    #[serde(default)]
    pub workers: u32,
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
}

/// Report output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("Batch_Probe_Reports")
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - AUDIO_PROBE_BACKEND -> backend.default
    /// - AUDIO_PROBE_USE_CONTAINERS -> backend.use_containers
    /// - AUDIO_PROBE_WORKERS -> batch.workers
    /// - AUDIO_PROBE_LOGICAL_CORES -> batch.logical_cores
    /// - AUDIO_PROBE_STAGE_TIMEOUT_SECS -> probe.stage_timeout_secs
    /// - AUDIO_PROBE_LOW_SCORE_THRESHOLD -> probe.low_score_threshold
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("AUDIO_PROBE_BACKEND") {
            let val = val.trim();
            if !val.is_empty() {
                self.backend.default = val.to_string();
            }
        }

        if let Ok(val) = env::var("AUDIO_PROBE_USE_CONTAINERS") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.backend.use_containers = true,
                "false" | "0" | "no" => self.backend.use_containers = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("AUDIO_PROBE_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.batch.workers = workers;
            }
        }

        if let Ok(val) = env::var("AUDIO_PROBE_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.batch.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("AUDIO_PROBE_STAGE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.probe.stage_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("AUDIO_PROBE_LOW_SCORE_THRESHOLD") {
            if let Ok(threshold) = val.parse::<u32>() {
                self.probe.low_score_threshold = threshold;
            }
        }
    }

    /// Reject values the probing engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.stage_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "probe.stage_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.backend.liveness_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend.liveness_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.probe.low_score_threshold > 100 {
            return Err(ConfigError::Invalid(format!(
                "probe.low_score_threshold must be at most 100, got {}",
                self.probe.low_score_threshold
            )));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
