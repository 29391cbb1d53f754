use std::fmt;

use chrono::{DateTime, Utc};
use crate::clip::{ClipRecord, Recording};
use crate::config::PipelineConfig;

/// Why a clip was taken out of consideration before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    OutsideWindow,
    WrongCategory,
    NoLinkedRecording,
    RecordingOutsideWindow,
    RecordingUnavailable,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DropReason::OutsideWindow => "outside lookback window",
            DropReason::WrongCategory => "wrong category",
            DropReason::NoLinkedRecording => "no linked recording",
            DropReason::RecordingOutsideWindow => "recording outside lookback window",
            DropReason::RecordingUnavailable => "recording unavailable",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop(DropReason),
}

/// Eligibility rules evaluated against one run's reference instant.
#[derive(Debug, Clone)]
pub struct ClipFilter {
    window_start: DateTime<Utc>,
    category: Option<String>,
    require_linked_recording: bool,
}

impl ClipFilter {
    pub fn new(config: &PipelineConfig, now: DateTime<Utc>) -> Self {
        Self {
            window_start: now - config.lookback(),
            category: config
                .category_filter_id
                .clone()
                .filter(|c| !c.trim().is_empty()),
            require_linked_recording: config.require_linked_recording,
        }
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Whether kept clips still need their recording checked.
    pub fn needs_recording(&self) -> bool {
        self.require_linked_recording
    }

    fn in_window(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.window_start
    }

    /// Checks the rules that need nothing beyond the clip itself.
    pub fn check_clip(&self, clip: &ClipRecord) -> Verdict {
        if !self.in_window(clip.created_at) {
            return Verdict::Drop(DropReason::OutsideWindow);
        }
        if let Some(category) = &self.category {
            if clip.game_id.as_deref() != Some(category.as_str()) {
                return Verdict::Drop(DropReason::WrongCategory);
            }
        }
        if self.require_linked_recording && clip.video_id.is_none() {
            return Verdict::Drop(DropReason::NoLinkedRecording);
        }
        Verdict::Keep
    }

    /// Checks a clip's fetched recording. `None` means the lookup failed or
    /// found nothing.
    pub fn check_recording(&self, recording: Option<&Recording>) -> Verdict {
        match recording {
            None => Verdict::Drop(DropReason::RecordingUnavailable),
            Some(r) if !self.in_window(r.created_at) => {
                Verdict::Drop(DropReason::RecordingOutsideWindow)
            }
            Some(_) => Verdict::Keep,
        }
    }
}
