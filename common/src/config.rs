use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plan::TimingPlan;
use crate::roi::Roi;

/// Upper bound on `[camera].fps`; keeps the frame period at or above 1 ms.
pub const MAX_FPS: f64 = 1000.0;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub roi: Roi,
    #[serde(default)]
    pub timing: TimingPlan,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// multipart MJPEG over HTTP
    Mjpeg,
    /// one JPEG per HTTP request
    Polling,
    /// synthetic frames, no camera needed
    Pattern,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub id: u32,
    #[serde(default = "default_source")]
    pub source: SourceMode,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_titer")]
    pub titer: String,
}

/// How captured images are named inside a run directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKey {
    /// The scheduled instant the capture satisfied.
    #[default]
    Scheduled,
    /// The measured elapsed time when the frame was taken.
    Elapsed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_frame_wait_ms")]
    pub frame_wait_ms: u64,
    #[serde(default)]
    pub boundary_epsilon_secs: Option<f64>,
    #[serde(default)]
    pub file_key: FileKey,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default = "default_first_frame_timeout_secs")]
    pub first_frame_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: 0,
            source: default_source(),
            url: default_url(),
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            target: default_target(),
            titer: default_titer(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            frame_wait_ms: default_frame_wait_ms(),
            boundary_epsilon_secs: None,
            file_key: FileKey::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            autostart: false,
            first_frame_timeout_secs: default_first_frame_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CameraConfig {
    /// Period between frames for the polling and pattern sources.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Tolerance on the session's closing boundary.
    ///
    /// Two polling quanta unless overridden: a capture due exactly at the end
    /// can be observed up to one quantum late, plus one for sleep overshoot.
    pub fn boundary_epsilon(&self) -> f64 {
        self.boundary_epsilon_secs
            .unwrap_or_else(|| 2.0 * self.poll_interval().as_secs_f64())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let fps = config.camera.fps;
        if !fps.is_finite() || !(fps > 0.0) || fps > MAX_FPS {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be in (0, {MAX_FPS}], got {fps}"
            )));
        }
        if config.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_source() -> SourceMode {
    SourceMode::Pattern
}
fn default_url() -> String {
    "http://127.0.0.1:8080/stream".into()
}
fn default_fps() -> f64 {
    30.0
}
fn default_width() -> u32 {
    720
}
fn default_height() -> u32 {
    1280
}
fn default_base_path() -> PathBuf {
    PathBuf::from("./sample")
}
fn default_target() -> String {
    "TRP".into()
}
fn default_titer() -> String {
    "Test_5.01".into()
}
fn default_poll_interval_ms() -> u64 {
    5
}
fn default_frame_wait_ms() -> u64 {
    10
}
fn default_shutdown_timeout_ms() -> u64 {
    2000
}
fn default_listen() -> String {
    "127.0.0.1:8700".into()
}
fn default_first_frame_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}
