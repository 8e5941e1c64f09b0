//! Hook for the adaptation-scoring engine.
//!
//! The scoring algorithm lives outside the sync engine. The coordinator
//! only calls it after remote sleep entries are applied and publishes the
//! result.

use slumber_sync_protocol::{AdaptationData, SleepEntry};

/// Pure function from sleep history to adaptation progress.
pub trait AdaptationEngine: Send + Sync {
    /// Computes progress from every known sleep entry.
    fn compute_adaptation(&self, entries: &[SleepEntry]) -> AdaptationData;
}

/// Scores adaptation from entry count, history span and average rating.
///
/// A stand-in used by the simulator; a real app injects its own engine.
#[derive(Debug, Clone, Copy)]
pub struct RatingAdaptation {
    /// Completed entries needed for full progress.
    pub target_entries: u32,
}

impl Default for RatingAdaptation {
    fn default() -> Self {
        Self { target_entries: 14 }
    }
}

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

impl AdaptationEngine for RatingAdaptation {
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn compute_adaptation(&self, entries: &[SleepEntry]) -> AdaptationData {
        let completed: Vec<&SleepEntry> = entries.iter().filter(|e| e.is_complete()).collect();
        let target = self.target_entries.max(1) as f64;
        let progress = (completed.len() as f64 / target).min(1.0);

        let first = completed.iter().map(|e| e.start_time).min();
        let last = completed.iter().filter_map(|e| e.end_time).max();
        let adaptation_day = match (first, last) {
            (Some(first), Some(last)) => {
                let span = last.duration_since(first).unwrap_or_default().as_secs();
                (span / SECONDS_PER_DAY).min(u64::from(u32::MAX)) as u32
            }
            _ => 0,
        };

        let ratings: Vec<f64> = completed
            .iter()
            .filter_map(|e| e.rating)
            .map(f64::from)
            .collect();
        let score = if ratings.is_empty() {
            0.0
        } else {
            ratings.iter().sum::<f64>() / ratings.len() as f64 * 20.0
        };

        AdaptationData {
            progress,
            adaptation_day,
            score,
        }
    }
}
