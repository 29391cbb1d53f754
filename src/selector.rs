//! Ordering and truncation of scored clips.
//!
//! Both passes use a stable sort, so clips with equal keys keep their input
//! order.

use std::cmp::Reverse;

use crate::scoring::ScoredClip;

/// Best `quota` clips of one broadcaster, highest view index first.
pub fn select_top_scored(clips: &[ScoredClip], quota: usize) -> Vec<ScoredClip> {
    let mut ranked: Vec<&ScoredClip> = clips.iter().collect();
    ranked.sort_by(|a, b| b.view_index().total_cmp(&a.view_index()));
    ranked.into_iter().take(quota).cloned().collect()
}

/// Cross-broadcaster cut: best `limit` clips by raw view count.
pub fn select_most_viewed(clips: &[ScoredClip], limit: usize) -> Vec<ScoredClip> {
    let mut ranked: Vec<&ScoredClip> = clips.iter().collect();
    ranked.sort_by_key(|clip| Reverse(clip.view_count()));
    ranked.into_iter().take(limit).cloned().collect()
}
