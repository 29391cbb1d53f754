use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clip::{ClipRecord, Recording};
use crate::config::ScoringConfig;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Raw signals the view index is computed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringInput {
    pub view_count: u64,
    pub clip_age_hours: f64,
    pub view_velocity: f64,
    /// Clip views divided by the source recording's views, when known.
    pub engagement_ratio: Option<f64>,
}

/// Fields derived while ranking a clip. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClipMetrics {
    pub clip_age_hours: f64,
    pub view_velocity: f64,
    pub view_index: f64,
    pub vod_age_hours: Option<f64>,
    pub engagement_ratio: Option<f64>,
}

/// A clip together with its ranking fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredClip {
    pub clip: ClipRecord,
    pub metrics: ClipMetrics,
}

impl ScoredClip {
    pub fn view_index(&self) -> f64 {
        self.metrics.view_index
    }

    pub fn view_count(&self) -> u64 {
        self.clip.view_count
    }
}

/// Hours elapsed from `then` to `now`; instants after `now` count as zero.
pub fn age_hours(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let seconds = (now - then).num_milliseconds() as f64 / 1000.0;
    (seconds / SECONDS_PER_HOUR).max(0.0)
}

/// Views per hour, with young clips treated as `min_velocity_age_hours` old.
pub fn view_velocity(config: &ScoringConfig, view_count: u64, clip_age_hours: f64) -> f64 {
    let age = clip_age_hours.max(config.min_velocity_age_hours);
    view_count as f64 / age
}

/// Computes the view index.
///
/// `log10(views + 1)` is discounted by an exponential age decay that never
/// falls below `decay_floor`, then boosted by the log-normalized velocity.
/// A clip with no views always scores zero.
pub fn view_index(config: &ScoringConfig, input: &ScoringInput) -> f64 {
    let age = if input.clip_age_hours.is_finite() {
        input.clip_age_hours.max(0.0)
    } else {
        f64::MAX
    };
    let velocity = if input.view_velocity.is_finite() {
        input.view_velocity.max(0.0)
    } else {
        0.0
    };

    let floor = config.decay_floor;
    let time_decay = floor + (1.0 - floor) * (-age / config.decay_horizon_hours).exp();
    let normalized_velocity = (velocity + 1.0).log10() / config.velocity_anchor.log10();
    let base_score = (input.view_count as f64 + 1.0).log10();

    let mut score = base_score * time_decay * (1.0 + config.velocity_weight * normalized_velocity);

    if let Some(ratio) = input.engagement_ratio.filter(|r| r.is_finite()) {
        score *= 1.0 + config.engagement_weight * ratio.clamp(0.0, 1.0);
    }

    score
}

impl ClipMetrics {
    /// Derives every ranking field of `clip` against the reference instant `now`.
    pub fn compute(
        config: &ScoringConfig,
        clip: &ClipRecord,
        recording: Option<&Recording>,
        now: DateTime<Utc>,
    ) -> Self {
        let clip_age_hours = age_hours(clip.created_at, now);
        let view_velocity = view_velocity(config, clip.view_count, clip_age_hours);

        let vod_age_hours = recording.map(|r| age_hours(r.created_at, now));
        let engagement_ratio = recording
            .filter(|r| r.view_count > 0)
            .map(|r| clip.view_count as f64 / r.view_count as f64);

        let view_index = view_index(
            config,
            &ScoringInput {
                view_count: clip.view_count,
                clip_age_hours,
                view_velocity,
                engagement_ratio,
            },
        );

        ClipMetrics {
            clip_age_hours,
            view_velocity,
            view_index,
            vod_age_hours,
            engagement_ratio,
        }
    }
}

pub fn score_clip(
    config: &ScoringConfig,
    clip: ClipRecord,
    recording: Option<&Recording>,
    now: DateTime<Utc>,
) -> ScoredClip {
    let metrics = ClipMetrics::compute(config, &clip, recording, now);
    ScoredClip { clip, metrics }
}
