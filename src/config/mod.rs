//! Configuration for stagepipe runs
//!
//! A [`PipelineConfig`] describes how a chain is assembled and driven:
//! - Channel capacity and overflow policy for every inserted channel
//! - Assembly mode (serial reference chain or cut into segments)
//! - Root rate policy
//! - Logging and report locations
//! - Synthetic workload for the bundled binary
//!
//! # Formats
//!
//! Files ending in `.json` are read and written as JSON; anything else is TOML.
//! Durations are stored as milliseconds (`*_ms` keys).
//!
//! # Default Location
//!
//! - **Linux**: `~/.config/stagepipe/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/stagepipe/pipeline.toml`
//! - **Windows**: `%APPDATA%\stagepipe\pipeline.toml`
//!
//! # Example
//!
//! ```toml
//! mode = "parallel"
//! channel_capacity = 8
//! overflow = "block"
//!
//! [rate]
//! max_rate = 20.0
//! dynamic_rate = true
//! dynamic_rate_scale = 1.1
//! update_interval_ms = 1000
//!
//! [workload]
//! frames = 300
//! ```

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::rate::duration_ms;
use crate::pipeline::{CutPoints, OverflowPolicy, RatePolicy, DEFAULT_CHANNEL_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "stagepipe";

/// Default config filename
pub const CONFIG_FILE: &str = "pipeline.toml";

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// How the chain is cut into segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyMode {
    /// One segment on the calling thread.
    Serial,
    /// Cut before every stage, or before the stages listed in `cuts`.
    #[default]
    Parallel,
}

/// Synthetic frame workload driven by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of frames the reader produces.
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    /// Simulated per-frame cost of each stage.
    pub costs: StageCosts,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            width: 320,
            height: 240,
            costs: StageCosts::default(),
        }
    }
}

/// Per-frame busy time of each synthetic stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCosts {
    #[serde(rename = "read_ms", with = "duration_ms")]
    pub read: Duration,
    #[serde(rename = "annotate_ms", with = "duration_ms")]
    pub annotate: Duration,
    #[serde(rename = "transform_ms", with = "duration_ms")]
    pub transform: Duration,
    #[serde(rename = "render_ms", with = "duration_ms")]
    pub render: Duration,
    #[serde(rename = "encode_ms", with = "duration_ms")]
    pub encode: Duration,
}

impl Default for StageCosts {
    fn default() -> Self {
        Self {
            read: Duration::from_millis(2),
            annotate: Duration::from_millis(8),
            transform: Duration::from_millis(4),
            render: Duration::from_millis(6),
            encode: Duration::from_millis(5),
        }
    }
}

/// Full configuration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: AssemblyMode,
    /// Cut before these stage indices in parallel mode. Empty cuts every stage.
    pub cuts: Vec<usize>,
    pub channel_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Directory for rolling log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Where the run report is written. `None` skips writing it.
    pub report_path: Option<PathBuf>,
    /// Policy applied to the root segment.
    pub rate: RatePolicy,
    pub workload: WorkloadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: AssemblyMode::Parallel,
            cuts: Vec::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            overflow: OverflowPolicy::Block,
            log_dir: None,
            report_path: Some(PathBuf::from("stagepipe-report.json")),
            rate: RatePolicy::dynamic(20.0),
            workload: WorkloadConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a config file, picking the format from its extension
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content).map_err(|e| {
                PipelineError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                PipelineError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to disk, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = if is_json(path) {
            serde_json::to_string_pretty(self)
                .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            toml::to_string_pretty(self)
                .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            PipelineError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> PipelineResult<()> {
        self.rate.validate()?;
        if self.mode == AssemblyMode::Parallel {
            if let Some(&bad) = self.cuts.iter().find(|&&c| c >= crate::workload::STAGE_COUNT) {
                return Err(PipelineError::Config(format!(
                    "cut before stage {} but the workload has {} stages",
                    bad,
                    crate::workload::STAGE_COUNT
                )));
            }
        }
        Ok(())
    }

    /// Cut points implied by `mode` and `cuts`
    pub fn cut_points(&self) -> CutPoints {
        match self.mode {
            AssemblyMode::Serial => CutPoints::Serial,
            AssemblyMode::Parallel if self.cuts.is_empty() => CutPoints::EveryStage,
            AssemblyMode::Parallel => CutPoints::Before(self.cuts.clone()),
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}
