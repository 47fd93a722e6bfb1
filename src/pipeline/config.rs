//! Pipeline configuration.
//!
//! Two layers of configuration drive a run:
//!
//! - [`PipelineConfig`]: process-wide runtime settings (directories, external
//!   commands, preload behaviour, artifact retention), read once at startup
//!   from defaults and `DSK_*` environment variables.
//! - [`JobConfig`]: the flat record of stage parameters supplied by the caller
//!   when a batch starts. Every field is optional and falls back to a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file has an unsupported extension.
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Directories
    /// Directory watched for uploaded videos.
    pub input_dir: PathBuf,
    /// Root under which per-job working trees are created.
    pub work_dir: PathBuf,
    /// Directory receiving packaged archives.
    pub results_dir: PathBuf,
    /// Directory holding the process log and its rotations.
    pub log_dir: PathBuf,

    // Resources
    /// Eagerly load shared resources before the stage chain runs.
    pub preload: bool,
    /// ffmpeg binary used for frame extraction.
    pub ffmpeg_bin: String,
    /// Super-resolution command (e.g. `realesrgan-ncnn-vulkan`).
    pub upscaler_cmd: Option<PathBuf>,
    /// Model name passed to the super-resolution command.
    pub upscaler_model: String,
    /// Face detector command.
    pub detector_cmd: Option<PathBuf>,
    /// Image tagger command.
    pub tagger_cmd: Option<PathBuf>,

    // Retention
    /// Time-to-live armed for every new artifact.
    pub result_ttl: Option<Duration>,
    /// Time-to-live armed once an artifact has been downloaded.
    pub download_grace: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            work_dir: PathBuf::from("work"),
            results_dir: PathBuf::from("output"),
            log_dir: PathBuf::from("logs"),

            preload: true,
            ffmpeg_bin: "ffmpeg".to_string(),
            upscaler_cmd: None,
            upscaler_model: "realesr-animevideov3".to_string(),
            detector_cmd: None,
            tagger_cmd: None,

            result_ttl: None,
            download_grace: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DSK_INPUT_DIR`: Upload directory (default: input)
    /// - `DSK_WORK_DIR`: Working tree root (default: work)
    /// - `DSK_OUTPUT_DIR`: Archive directory (default: output)
    /// - `DSK_LOG_DIR`: Process log directory (default: logs)
    /// - `DSK_PRELOAD`: Preload shared resources (default: 1)
    /// - `DSK_FFMPEG`: ffmpeg binary (default: ffmpeg)
    /// - `DSK_UPSCALER_CMD`: Super-resolution command
    /// - `DSK_UPSCALER_MODEL`: Super-resolution model (default: realesr-animevideov3)
    /// - `DSK_DETECTOR_CMD`: Face detector command
    /// - `DSK_TAGGER_CMD`: Tagger command
    /// - `DSK_RESULT_TTL_SECS`: Artifact retention in seconds
    /// - `DSK_DOWNLOAD_GRACE_SECS`: Retention after download in seconds
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DSK_INPUT_DIR") {
            config.input_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DSK_WORK_DIR") {
            config.work_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DSK_OUTPUT_DIR") {
            config.results_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("DSK_LOG_DIR") {
            config.log_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("DSK_PRELOAD") {
            config.preload = parse_env_bool(&val, "DSK_PRELOAD")?;
        }
        if let Ok(val) = std::env::var("DSK_FFMPEG") {
            config.ffmpeg_bin = val;
        }
        if let Ok(val) = std::env::var("DSK_UPSCALER_CMD") {
            config.upscaler_cmd = non_empty_path(val);
        }
        if let Ok(val) = std::env::var("DSK_UPSCALER_MODEL") {
            config.upscaler_model = val;
        }
        if let Ok(val) = std::env::var("DSK_DETECTOR_CMD") {
            config.detector_cmd = non_empty_path(val);
        }
        if let Ok(val) = std::env::var("DSK_TAGGER_CMD") {
            config.tagger_cmd = non_empty_path(val);
        }

        if let Ok(val) = std::env::var("DSK_RESULT_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "DSK_RESULT_TTL_SECS")?;
            config.result_ttl = Some(Duration::from_secs(secs));
        }
        if let Ok(val) = std::env::var("DSK_DOWNLOAD_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "DSK_DOWNLOAD_GRACE_SECS")?;
            config.download_grace = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, dir) in [
            ("input_dir", &self.input_dir),
            ("work_dir", &self.work_dir),
            ("results_dir", &self.results_dir),
            ("log_dir", &self.log_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot be empty",
                    name
                )));
            }
        }

        // A job's working root is removed recursively; it must never contain
        // the uploads or the archives.
        if self.input_dir.starts_with(&self.work_dir) || self.results_dir.starts_with(&self.work_dir)
        {
            return Err(ConfigError::ValidationFailed(
                "work_dir must not contain input_dir or results_dir".to_string(),
            ));
        }

        if self.ffmpeg_bin.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "ffmpeg_bin cannot be empty".to_string(),
            ));
        }

        if self.result_ttl == Some(Duration::ZERO) {
            return Err(ConfigError::ValidationFailed(
                "result_ttl must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to place every directory under one root.
    pub fn with_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.input_dir = root.join("input");
        self.work_dir = root.join("work");
        self.results_dir = root.join("output");
        self.log_dir = root.join("logs");
        self
    }

    /// Builder method to enable or disable preloading.
    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    /// Builder method to set the ffmpeg binary.
    pub fn with_ffmpeg_bin(mut self, bin: impl Into<String>) -> Self {
        self.ffmpeg_bin = bin.into();
        self
    }

    /// Builder method to set the artifact retention.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    /// Builder method to set the retention applied after a download.
    pub fn with_download_grace(mut self, grace: Duration) -> Self {
        self.download_grace = Some(grace);
        self
    }
}

/// Stage parameters supplied when a batch starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    /// Label prepended to every caption.
    pub trigger_word: String,
    /// Frames sampled per second of video.
    pub frames_per_second: u32,
    /// Maximum Hamming distance between two frame hashes considered duplicates.
    pub dedup_threshold: u32,
    /// Upscaling factor.
    pub upscale_factor: u32,
    /// Minimum Laplacian variance; blurrier frames are dropped.
    pub blur_variance_min: f64,
    /// Minimum mean luma; darker frames are dropped.
    pub brightness_min: f64,
    /// Margin added around a detected face, as a fraction of the box size.
    pub crop_margin_fraction: f64,
    /// Minimum detector confidence for a face to be cropped.
    pub detection_confidence_min: f64,
    /// Number of images sent to the detector per call.
    pub detection_batch_size: usize,
    /// Minimum tagger score for a tag to enter the caption.
    pub tag_threshold: f64,

    pub skip_deduplication: bool,
    pub skip_filtering: bool,
    pub skip_upscaling: bool,
    pub skip_cropping: bool,
    pub skip_annotation: bool,
    pub skip_classification: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            trigger_word: "name".to_string(),
            frames_per_second: 1,
            dedup_threshold: 8,
            upscale_factor: 4,
            blur_variance_min: 100.0,
            brightness_min: 40.0,
            crop_margin_fraction: 0.3,
            detection_confidence_min: 0.5,
            detection_batch_size: 4,
            tag_threshold: 0.35,

            skip_deduplication: false,
            skip_filtering: false,
            skip_upscaling: false,
            skip_cropping: false,
            skip_annotation: false,
            skip_classification: false,
        }
    }
}

impl JobConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a `.json`, `.yaml` or `.yml` file.
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        let config: Self = match extension.as_str() {
            "json" => serde_json::from_str(&content)?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the stage parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger_word.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "trigger_word cannot be empty".to_string(),
            ));
        }

        if self.frames_per_second == 0 {
            return Err(ConfigError::ValidationFailed(
                "frames_per_second must be greater than 0".to_string(),
            ));
        }

        if self.dedup_threshold > 64 {
            return Err(ConfigError::ValidationFailed(
                "dedup_threshold must be between 0 and 64".to_string(),
            ));
        }

        if !(1..=8).contains(&self.upscale_factor) {
            return Err(ConfigError::ValidationFailed(
                "upscale_factor must be between 1 and 8".to_string(),
            ));
        }

        if self.blur_variance_min < 0.0 || self.brightness_min < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "blur_variance_min and brightness_min cannot be negative".to_string(),
            ));
        }

        if self.crop_margin_fraction < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "crop_margin_fraction cannot be negative".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection_confidence_min) {
            return Err(ConfigError::ValidationFailed(
                "detection_confidence_min must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.detection_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "detection_batch_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.tag_threshold) {
            return Err(ConfigError::ValidationFailed(
                "tag_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the trigger word.
    pub fn with_trigger_word(mut self, word: impl Into<String>) -> Self {
        self.trigger_word = word.into();
        self
    }

    /// Builder method to set the frame sampling rate.
    pub fn with_frames_per_second(mut self, fps: u32) -> Self {
        self.frames_per_second = fps;
        self
    }

    /// Builder method to set the upscaling factor.
    pub fn with_upscale_factor(mut self, factor: u32) -> Self {
        self.upscale_factor = factor;
        self
    }

    /// Builder method to mark every optional stage as skipped.
    pub fn skip_all(mut self) -> Self {
        self.skip_deduplication = true;
        self.skip_filtering = true;
        self.skip_upscaling = true;
        self.skip_cropping = true;
        self.skip_annotation = true;
        self.skip_classification = true;
        self
    }
}

fn non_empty_path(value: String) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
