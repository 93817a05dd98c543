//! Rig configuration.
//!
//! Loaded in three layers, each overriding the last: built-in defaults, an
//! optional JSON file named by `RIG_CONFIG`, then `RIG_*` environment
//! variables. Validation runs before any worker thread starts; a bad
//! configuration never reaches the barrier.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::MAX_CAMERAS;

const DEFAULT_CAMERA_COUNT: usize = 1;
const DEFAULT_HOST_PREFIX: &str = "jetson";
const DEFAULT_HOST_SUFFIX: &str = ".local";
const DEFAULT_PORT: u16 = 3490;
const DEFAULT_CONNECT_RETRY_MS: u64 = 500;
const DEFAULT_SKEW_THRESHOLD_MS: i64 = 30;
const DEFAULT_TELEMETRY_WINDOW: u32 = 30;
const DEFAULT_RECORDING_CYCLE: u64 = 80;
const DEFAULT_RECORDING_DIR: &str = "recordings";

#[derive(Debug, Deserialize, Default)]
struct RigConfigFile {
    camera_count: Option<usize>,
    servers: Option<ServersConfigFile>,
    sync: Option<SyncConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
    recording: Option<RecordingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServersConfigFile {
    host_prefix: Option<String>,
    host_suffix: Option<String>,
    port: Option<u16>,
    connect_retry_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncConfigFile {
    skew_threshold_ms: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    window_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    directory: Option<String>,
    cycle_frames: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RigConfig {
    pub camera_count: usize,
    /// Server hostnames are `<prefix><1-based index><suffix>`.
    pub host_prefix: String,
    pub host_suffix: String,
    pub port: u16,
    pub connect_retry: Duration,
    /// Frames further than this behind the newest stream are dropped.
    pub skew_threshold_ms: i64,
    pub telemetry_window: u32,
    pub recording_cycle: u64,
    pub recording_dir: PathBuf,
    pub record_images: bool,
    pub record_pattern: bool,
    pub display: bool,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            camera_count: DEFAULT_CAMERA_COUNT,
            host_prefix: DEFAULT_HOST_PREFIX.to_string(),
            host_suffix: DEFAULT_HOST_SUFFIX.to_string(),
            port: DEFAULT_PORT,
            connect_retry: Duration::from_millis(DEFAULT_CONNECT_RETRY_MS),
            skew_threshold_ms: DEFAULT_SKEW_THRESHOLD_MS,
            telemetry_window: DEFAULT_TELEMETRY_WINDOW,
            recording_cycle: DEFAULT_RECORDING_CYCLE,
            recording_dir: PathBuf::from(DEFAULT_RECORDING_DIR),
            record_images: false,
            record_pattern: false,
            display: false,
        }
    }
}

impl RigConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RIG_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => read_config_file(Path::new(path))?,
            None => RigConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RigConfigFile) -> Self {
        let defaults = Self::default();
        let servers = file.servers.unwrap_or_default();
        let sync = file.sync.unwrap_or_default();
        let telemetry = file.telemetry.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        Self {
            camera_count: file.camera_count.unwrap_or(defaults.camera_count),
            host_prefix: servers.host_prefix.unwrap_or(defaults.host_prefix),
            host_suffix: servers.host_suffix.unwrap_or(defaults.host_suffix),
            port: servers.port.unwrap_or(defaults.port),
            connect_retry: servers
                .connect_retry_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_retry),
            skew_threshold_ms: sync.skew_threshold_ms.unwrap_or(defaults.skew_threshold_ms),
            telemetry_window: telemetry.window_frames.unwrap_or(defaults.telemetry_window),
            recording_cycle: recording.cycle_frames.unwrap_or(defaults.recording_cycle),
            recording_dir: recording
                .directory
                .map(PathBuf::from)
                .unwrap_or(defaults.recording_dir),
            record_images: defaults.record_images,
            record_pattern: defaults.record_pattern,
            display: defaults.display,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(count) = std::env::var("RIG_CAMERA_COUNT") {
            self.camera_count = count
                .parse()
                .map_err(|_| anyhow!("RIG_CAMERA_COUNT must be an integer"))?;
        }
        if let Ok(prefix) = std::env::var("RIG_HOST_PREFIX") {
            if !prefix.trim().is_empty() {
                self.host_prefix = prefix;
            }
        }
        if let Ok(suffix) = std::env::var("RIG_HOST_SUFFIX") {
            self.host_suffix = suffix;
        }
        if let Ok(port) = std::env::var("RIG_PORT") {
            self.port = port
                .parse()
                .map_err(|_| anyhow!("RIG_PORT must be a port number"))?;
        }
        if let Ok(retry) = std::env::var("RIG_CONNECT_RETRY_MS") {
            let ms: u64 = retry
                .parse()
                .map_err(|_| anyhow!("RIG_CONNECT_RETRY_MS must be milliseconds"))?;
            self.connect_retry = Duration::from_millis(ms);
        }
        if let Ok(threshold) = std::env::var("RIG_SKEW_THRESHOLD_MS") {
            self.skew_threshold_ms = threshold
                .parse()
                .map_err(|_| anyhow!("RIG_SKEW_THRESHOLD_MS must be milliseconds"))?;
        }
        if let Ok(window) = std::env::var("RIG_TELEMETRY_WINDOW") {
            self.telemetry_window = window
                .parse()
                .map_err(|_| anyhow!("RIG_TELEMETRY_WINDOW must be a frame count"))?;
        }
        if let Ok(cycle) = std::env::var("RIG_RECORDING_CYCLE") {
            self.recording_cycle = cycle
                .parse()
                .map_err(|_| anyhow!("RIG_RECORDING_CYCLE must be a frame count"))?;
        }
        if let Ok(dir) = std::env::var("RIG_RECORDING_DIR") {
            if !dir.trim().is_empty() {
                self.recording_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera_count == 0 {
            return Err(anyhow!("camera count must be at least 1"));
        }
        if self.camera_count > MAX_CAMERAS {
            return Err(anyhow!(
                "currently supporting up to {} cameras, got {}",
                MAX_CAMERAS,
                self.camera_count
            ));
        }
        if self.host_prefix.trim().is_empty() {
            return Err(anyhow!("server host prefix must not be empty"));
        }
        if self.skew_threshold_ms < 0 {
            return Err(anyhow!("skew threshold must not be negative"));
        }
        if self.telemetry_window == 0 {
            return Err(anyhow!("telemetry window must be at least one frame"));
        }
        if self.recording_cycle == 0 {
            return Err(anyhow!("recording cycle must be at least one frame"));
        }
        Ok(())
    }

    /// Hostname of the camera server for a zero-based worker index; camera
    /// indices on the rig are 1-based.
    pub fn server_host(&self, index: usize) -> String {
        format!("{}{}{}", self.host_prefix, index + 1, self.host_suffix)
    }
}

fn read_config_file(path: &Path) -> Result<RigConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
