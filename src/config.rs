use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as TimeDelta;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "clipper.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration, loaded from `clipper.json` when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClipperConfig {
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathsConfig {
    /// Roster of broadcasters, `[{ "username": .., "id": .. }]`.
    pub broadcasters_file: PathBuf,
    /// Day folders are created next to this path as `<base>_<YYYY-MM-DD>`.
    pub base_download_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            broadcasters_file: PathBuf::from("broadcasters.json"),
            base_download_path: PathBuf::from("twitch_clips"),
        }
    }
}

/// Knobs for the fetch, filter, score and select stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub lookback_window_hours: u32,
    pub clips_per_broadcaster: usize,
    pub global_top_count: usize,
    pub only_download_most_viewed: bool,
    pub category_filter_id: Option<String>,
    pub require_linked_recording: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub download_batch_size: usize,
    /// Pause between consecutive broadcaster fetches.
    pub fetch_delay_ms: u64,
    /// Pause between download batches.
    pub batch_pause_ms: u64,
    /// Upper bound on clips listed per broadcaster, across pages.
    pub max_clips_per_fetch: usize,
    pub scoring: ScoringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookback_window_hours: 24,
            clips_per_broadcaster: 8,
            global_top_count: 20,
            only_download_most_viewed: false,
            category_filter_id: None,
            require_linked_recording: false,
            max_retries: 3,
            retry_delay_ms: 1000,
            download_batch_size: 5,
            fetch_delay_ms: 250,
            batch_pause_ms: 500,
            max_clips_per_fetch: 100,
            scoring: ScoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn lookback(&self) -> TimeDelta {
        TimeDelta::hours(i64::from(self.lookback_window_hours))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_delay_ms)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_window_hours == 0 {
            return Err(ConfigError::Invalid(
                "lookbackWindowHours must be at least 1".to_string(),
            ));
        }
        if self.clips_per_broadcaster == 0 {
            return Err(ConfigError::Invalid(
                "clipsPerBroadcaster must be at least 1".to_string(),
            ));
        }
        if self.only_download_most_viewed && self.global_top_count == 0 {
            return Err(ConfigError::Invalid(
                "globalTopCount must be at least 1 when onlyDownloadMostViewed is set".to_string(),
            ));
        }
        if self.download_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "downloadBatchSize must be at least 1".to_string(),
            ));
        }
        if self.max_clips_per_fetch == 0 {
            return Err(ConfigError::Invalid(
                "maxClipsPerFetch must be at least 1".to_string(),
            ));
        }
        self.scoring.validate()
    }
}

/// Tuning constants for the view index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringConfig {
    /// Lowest multiplier age can push a score down to.
    pub decay_floor: f64,
    /// e-folding time of the age decay, in hours.
    pub decay_horizon_hours: f64,
    pub velocity_weight: f64,
    /// Velocity (views/hour) that normalizes to 1.0, minus one.
    pub velocity_anchor: f64,
    /// Ages below this are clamped when computing velocity.
    pub min_velocity_age_hours: f64,
    /// Weight of the clip-to-VOD view ratio. Zero disables the VOD variant.
    pub engagement_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            decay_floor: 0.95,
            decay_horizon_hours: 24.0,
            velocity_weight: 0.3,
            velocity_anchor: 1000.0,
            min_velocity_age_hours: 1.0,
            engagement_weight: 0.0,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.decay_floor) {
            return Err(ConfigError::Invalid(
                "scoring.decayFloor must lie in [0, 1]".to_string(),
            ));
        }
        if !(self.decay_horizon_hours > 0.0) {
            return Err(ConfigError::Invalid(
                "scoring.decayHorizonHours must be positive".to_string(),
            ));
        }
        if !(self.velocity_anchor > 1.0) {
            return Err(ConfigError::Invalid(
                "scoring.velocityAnchor must be greater than 1".to_string(),
            ));
        }
        if !(self.min_velocity_age_hours > 0.0) {
            return Err(ConfigError::Invalid(
                "scoring.minVelocityAgeHours must be positive".to_string(),
            ));
        }
        if self.velocity_weight < 0.0 || self.engagement_weight < 0.0 {
            return Err(ConfigError::Invalid(
                "scoring weights must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// How clip media is fetched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DownloadConfig {
    /// External program to shell out to instead of downloading over HTTP.
    pub helper: Option<String>,
    /// Arguments for the helper; `{url}` and `{output}` are substituted.
    pub helper_args: Vec<String>,
}

impl ClipperConfig {
    /// Loads the config file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        if self.download.helper.is_some()
            && !self.download.helper_args.iter().any(|a| a.contains("{output}"))
        {
            return Err(ConfigError::Invalid(
                "download.helperArgs must contain an {output} placeholder".to_string(),
            ));
        }
        Ok(())
    }
}
