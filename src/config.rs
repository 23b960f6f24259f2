//! Run configuration, loaded once by the Monitor from a TOML file.
//!
//! Field names and the `kebab-case` + `default = "fn"` pattern follow the
//! teacher's `config.rs`; the single pair of hardcoded cameras is replaced
//! with `Vec<CameraConfig>` the way `onurtuna-OasisNvr`'s config does.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Top-level run configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub paths: PathsConfig,
    pub cameras: Vec<CameraConfig>,
}

/// Directories the Monitor owns and cleans before starting pipelines.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathsConfig {
    pub stream_path: PathBuf,
    pub sample_path: PathBuf,
    pub region_path: PathBuf,
    #[serde(default)]
    pub offline_path: Option<PathBuf>,
}

/// Per-camera configuration; one Pipeline is built per enabled entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CameraConfig {
    pub index: u32,

    /// Human-readable label used in log lines and status output.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_enable")]
    pub enable: bool,

    #[serde(default)]
    pub online: bool,

    #[serde(default)]
    pub rtsp: Option<String>,

    pub routine: TileGrid,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_sample_interval_minutes")]
    pub sample_interval_minutes: u32,

    #[serde(default)]
    pub resize: ResizeConfig,

    #[serde(default)]
    pub roi: RoiConfig,

    /// Gates the RTSP per-frame PNG snapshot hook (`post_frame_process`).
    /// Only consulted for the RTSP Capture variant; unrelated to
    /// `archive_sample` below.
    #[serde(default)]
    pub enable_sample_frame: bool,

    #[serde(default = "default_rtsp_saved_per_frame")]
    pub rtsp_saved_per_frame: u32,

    /// Selects the Archive-sample-online history policy for an indexed
    /// (non-RTSP) online camera, in place of plain delete-on-close.
    /// Decoupled from `enable_sample_frame`, which is RTSP-only.
    #[serde(default)]
    pub archive_sample: bool,

    #[serde(default = "default_draw_boundary")]
    pub draw_boundary: bool,

    #[serde(default)]
    pub show_window: bool,

    #[serde(default)]
    pub delete_post: Option<bool>,

    /// 0 = retry forever. Only consulted by the RTSP source variant, which
    /// re-opens the same URL on every failure and would otherwise busy-loop.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

/// Tile grid dimensions. `rows * cols` TileDetectors are wired per camera.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TileGrid {
    pub row: usize,
    pub col: usize,
}

impl TileGrid {
    pub fn count(&self) -> usize {
        self.row * self.col
    }
}

/// Preprocessing resize; first non-`-1` field wins, order scale -> width -> height.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResizeConfig {
    #[serde(default = "default_disabled")]
    pub scale: f32,
    #[serde(default = "default_disabled_i")]
    pub width: i32,
    #[serde(default = "default_disabled_i")]
    pub height: i32,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            scale: default_disabled(),
            width: default_disabled_i(),
            height: default_disabled_i(),
        }
    }
}

/// Crop rectangle applied after resize, in the resized coordinate space.
/// A zero-size rectangle (the default) means "no crop".
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RoiConfig {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self { x: 0, y: 0, width: 0, height: 0 }
    }
}

fn default_enable() -> bool { true }
fn default_sample_rate() -> u32 { 1 }
fn default_sample_interval_minutes() -> u32 { 10 }
fn default_rtsp_saved_per_frame() -> u32 { 5 }
fn default_draw_boundary() -> bool { true }
fn default_disabled() -> f32 { -1.0 }
fn default_disabled_i() -> i32 { -1 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!("cannot read config file: {e}"))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(PipelineError::Config("no cameras defined".into()));
        }
        for cam in &self.cameras {
            if cam.routine.row == 0 || cam.routine.col == 0 {
                return Err(PipelineError::Config(format!(
                    "camera {}: tile grid must be at least 1x1",
                    cam.index
                )));
            }
            if cam.sample_rate == 0 {
                return Err(PipelineError::Config(format!(
                    "camera {}: sample_rate must be > 0",
                    cam.index
                )));
            }
            if !cam.online && self.paths.offline_path.is_none() {
                return Err(PipelineError::Config(format!(
                    "camera {}: offline mode requires paths.offline-path",
                    cam.index
                )));
            }
            // `online` alone does not imply RTSP: an online camera without an
            // `rtsp` url is the indexed-online variant, fed from
            // `paths.stream-path` instead of a live URL.
        }
        Ok(())
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.enable)
    }
}

impl CameraConfig {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.index.to_string())
    }
}
