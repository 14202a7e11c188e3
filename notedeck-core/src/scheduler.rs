use crate::{Quality, ReviewState, ScheduledReview};
use chrono::{DateTime, Duration, Utc};

pub const INTERVAL_MIN_DAYS: u32 = 1;
pub const INTERVAL_MAX_DAYS: u32 = 14;

/// Days until the next review: `floor((6 - quality) * 2.8)` clamped to
/// `[INTERVAL_MIN_DAYS, INTERVAL_MAX_DAYS]`.
///
/// Computed in tenths so the floor is exact: 0..=5 maps to 14, 14, 11, 8, 5, 2.
pub fn days_until_review(quality: Quality) -> u32 {
    let raw = (6 - quality.value() as u32) * 28 / 10;
    raw.clamp(INTERVAL_MIN_DAYS, INTERVAL_MAX_DAYS)
}

/// Computes the review state to persist after a review graded `quality`
/// at `now`. Pure: no clock reads, no I/O.
pub fn schedule(quality: Quality, now: DateTime<Utc>, prior_review_count: u32) -> ScheduledReview {
    let days = days_until_review(quality);
    ScheduledReview {
        review_count: prior_review_count.saturating_add(1),
        last_reviewed: now,
        next_review_date: now + Duration::days(days as i64),
    }
}

impl ReviewState {
    pub fn schedule(&self, quality: Quality, now: DateTime<Utc>) -> ScheduledReview {
        schedule(quality, now, self.review_count)
    }
}
