//! Per-broadcaster fetch, filter, score and select, then batched download.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::broadcasters::Broadcaster;
use crate::clip::{ClipRecord, Recording};
use crate::config::PipelineConfig;
use crate::download::{ClipDownloader, DownloadOutcome};
use crate::filter::{ClipFilter, DropReason, Verdict};
use crate::retry::RetryPolicy;
use crate::scoring::{score_clip, ScoredClip};
use crate::selector::{select_most_viewed, select_top_scored};
use crate::twitch::TwitchError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication failed, aborting run: {0}")]
    Unauthorized(#[source] TwitchError),
}

/// Where clips and their recordings come from.
#[async_trait]
pub trait ClipSource: Send + Sync {
    /// Clips created in `[window_start, window_end]`, at most `limit`.
    async fn fetch_clips(
        &self,
        broadcaster: &Broadcaster,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClipRecord>, TwitchError>;

    async fn fetch_recording(&self, video_id: &str) -> Result<Option<Recording>, TwitchError>;
}

/// Counts gathered while selecting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionStats {
    pub fetched: usize,
    pub dropped: BTreeMap<DropReason, usize>,
    pub scored: usize,
    pub failed_broadcasters: Vec<String>,
}

impl SelectionStats {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    fn record_drop(&mut self, reason: DropReason) {
        *self.dropped.entry(reason).or_default() += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub clips: Vec<ScoredClip>,
    pub stats: SelectionStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub downloaded: usize,
    pub already_present: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stats: SelectionStats,
    pub selected: usize,
    pub downloads: DownloadReport,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fetched:         {}", self.stats.fetched)?;
        writeln!(f, "Filtered out:    {}", self.stats.dropped_total())?;
        for (reason, count) in &self.stats.dropped {
            writeln!(f, "  {reason}: {count}")?;
        }
        writeln!(f, "Selected:        {}", self.selected)?;
        writeln!(f, "Downloaded:      {}", self.downloads.downloaded)?;
        writeln!(f, "Already present: {}", self.downloads.already_present)?;
        write!(f, "Failed:          {}", self.downloads.failed)?;
        if !self.stats.failed_broadcasters.is_empty() {
            write!(
                f,
                "\nBroadcasters with no data: {}",
                self.stats.failed_broadcasters.join(", ")
            )?;
        }
        Ok(())
    }
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    source: &'a dyn ClipSource,
    retry: RetryPolicy,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, source: &'a dyn ClipSource) -> Self {
        Self {
            config,
            source,
            retry: RetryPolicy::new(config.max_retries, config.retry_delay()),
        }
    }

    /// Selects clips for every broadcaster against the reference instant `now`.
    ///
    /// A broadcaster whose fetch keeps failing contributes nothing; only an
    /// authentication failure stops the run.
    pub async fn select(
        &self,
        broadcasters: &[Broadcaster],
        now: DateTime<Utc>,
    ) -> Result<Selection, PipelineError> {
        let filter = ClipFilter::new(self.config, now);
        let mut selection = Selection::default();

        for (i, broadcaster) in broadcasters.iter().enumerate() {
            if i > 0 && !self.config.fetch_delay().is_zero() {
                tokio::time::sleep(self.config.fetch_delay()).await;
            }

            let raw = match self.fetch_clips(broadcaster, &filter, now).await? {
                Some(raw) => raw,
                None => {
                    selection
                        .stats
                        .failed_broadcasters
                        .push(broadcaster.username.clone());
                    continue;
                }
            };
            selection.stats.fetched += raw.len();

            let scored = self.score_broadcaster(raw, &filter, now, &mut selection.stats).await?;
            selection.stats.scored += scored.len();

            let top = select_top_scored(&scored, self.config.clips_per_broadcaster);
            info!(
                "{}: kept {} of {} eligible clips",
                broadcaster.username,
                top.len(),
                scored.len()
            );
            selection.clips.extend(top);
        }

        if self.config.only_download_most_viewed {
            let before = selection.clips.len();
            selection.clips = select_most_viewed(&selection.clips, self.config.global_top_count);
            info!(
                "Most-viewed cut kept {} of {} clips",
                selection.clips.len(),
                before
            );
        }

        Ok(selection)
    }

    /// `Ok(None)` when the broadcaster's clips could not be listed.
    async fn fetch_clips(
        &self,
        broadcaster: &Broadcaster,
        filter: &ClipFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<ClipRecord>>, PipelineError> {
        let label = format!("fetch clips for {}", broadcaster.username);
        let result = self
            .retry
            .attempt(&label, || {
                self.source.fetch_clips(
                    broadcaster,
                    filter.window_start(),
                    now,
                    self.config.max_clips_per_fetch,
                )
            })
            .await;

        match result {
            Ok(clips) => Ok(Some(clips)),
            Err(err) if err.is_auth_failure() => Err(PipelineError::Unauthorized(err)),
            Err(err) => {
                warn!("Skipping {}: {}", broadcaster.username, err);
                Ok(None)
            }
        }
    }

    async fn fetch_recording(&self, video_id: &str) -> Result<Option<Recording>, PipelineError> {
        let label = format!("fetch recording {video_id}");
        match self
            .retry
            .attempt(&label, || self.source.fetch_recording(video_id))
            .await
        {
            Ok(recording) => Ok(recording),
            Err(err) if err.is_auth_failure() => Err(PipelineError::Unauthorized(err)),
            Err(err) => {
                warn!("Recording {video_id} unavailable: {err}");
                Ok(None)
            }
        }
    }

    /// Filters and scores one broadcaster's clips, preserving listing order.
    async fn score_broadcaster(
        &self,
        raw: Vec<ClipRecord>,
        filter: &ClipFilter,
        now: DateTime<Utc>,
        stats: &mut SelectionStats,
    ) -> Result<Vec<ScoredClip>, PipelineError> {
        let scoring = &self.config.scoring;
        let mut scored = Vec::with_capacity(raw.len());

        for clip in raw {
            if let Verdict::Drop(reason) = filter.check_clip(&clip) {
                debug!("Dropping clip {}: {}", clip.id, reason);
                stats.record_drop(reason);
                continue;
            }

            let recording = match (&clip.video_id, filter.needs_recording()) {
                (Some(video_id), true) => {
                    let recording = self.fetch_recording(video_id).await?;
                    if let Verdict::Drop(reason) = filter.check_recording(recording.as_ref()) {
                        debug!("Dropping clip {}: {}", clip.id, reason);
                        stats.record_drop(reason);
                        continue;
                    }
                    if let Some(r) = &recording {
                        debug!("Clip {} cut from recording {}", clip.id, r.id);
                    }
                    recording
                }
                _ => None,
            };

            scored.push(score_clip(scoring, clip, recording.as_ref(), now));
        }

        Ok(scored)
    }

    /// Hands the selection to `downloader` in fixed-size concurrent batches.
    ///
    /// Each clip is requested exactly once; retrying is the downloader's
    /// business. A batch finishes before the next one starts. When the
    /// destination cannot be created every clip counts as failed.
    pub async fn download(
        &self,
        downloader: &dyn ClipDownloader,
        clips: &[ScoredClip],
        dest_dir: &Path,
    ) -> DownloadReport {
        let mut report = DownloadReport::default();

        if let Err(err) = tokio::fs::create_dir_all(dest_dir).await {
            error!("Cannot create {}: {}", dest_dir.display(), err);
            report.failed = clips.len();
            return report;
        }

        let batch_size = self.config.download_batch_size.max(1);

        for (i, batch) in clips.chunks(batch_size).enumerate() {
            if i > 0 && !self.config.batch_pause().is_zero() {
                tokio::time::sleep(self.config.batch_pause()).await;
            }

            let results = join_all(batch.iter().map(|scored| async move {
                let clip = &scored.clip;
                (clip, downloader.download(clip, dest_dir).await)
            }))
            .await;

            for (clip, result) in results {
                match result {
                    Ok(DownloadOutcome::Downloaded) => report.downloaded += 1,
                    Ok(DownloadOutcome::AlreadyPresent) => {
                        info!("{} already downloaded, skipping", clip.file_name());
                        report.already_present += 1;
                    }
                    Err(err) => {
                        warn!("Failed to download {}: {}", clip.id, err);
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Select then download; the whole run.
    pub async fn run(
        &self,
        broadcasters: &[Broadcaster],
        downloader: &dyn ClipDownloader,
        dest_dir: &Path,
        now: DateTime<Utc>,
    ) -> Result<RunSummary, PipelineError> {
        let selection = self.select(broadcasters, now).await?;
        let downloads = self.download(downloader, &selection.clips, dest_dir).await;
        Ok(RunSummary {
            selected: selection.clips.len(),
            stats: selection.stats,
            downloads,
        })
    }
}
