use crate::{DeckId, NoteId, Quality, Review};
use chrono::{Duration, NaiveDate};
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Default)]
pub struct Totals {
    pub total: u32,
    pub failed: u32,
    pub recalled: u32,
    pub by_quality: [u32; 6],
}

impl Totals {
    pub fn record(&mut self, q: Quality) {
        self.total += 1;
        self.by_quality[q.value() as usize] += 1;
        if q.is_failure() {
            self.failed += 1;
        } else {
            self.recalled += 1;
        }
    }

    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.recalled as f32 / self.total as f32
        }
    }

    pub fn mean_quality(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        let sum: u32 = self
            .by_quality
            .iter()
            .enumerate()
            .map(|(q, n)| q as u32 * n)
            .sum();
        sum as f32 / self.total as f32
    }
}

#[derive(Clone, Debug, Default)]
pub struct StatsSummary {
    pub totals: Totals,
    pub per_day: BTreeMap<NaiveDate, Totals>,
}

pub fn summarize(reviews: &[Review]) -> StatsSummary {
    let mut summary = StatsSummary::default();
    for r in reviews {
        summary.totals.record(r.quality);
        let d = r.reviewed_at.date_naive();
        summary.per_day.entry(d).or_default().record(r.quality);
    }
    summary
}

/// Consecutive days with at least one review, counting back from `today`.
pub fn daily_streak(reviews: &[Review], today: NaiveDate) -> u32 {
    let per_day = summarize(reviews).per_day;
    let mut streak = 0u32;
    let mut day = today;
    while per_day.get(&day).map(|t| t.total > 0).unwrap_or(false) {
        streak += 1;
        day -= Duration::days(1);
    }
    streak
}

pub fn per_deck_totals(
    reviews: &[Review],
    note_to_deck: &HashMap<NoteId, DeckId>,
) -> HashMap<DeckId, Totals> {
    let mut map: HashMap<DeckId, Totals> = HashMap::new();
    for r in reviews {
        if let Some(deck_id) = note_to_deck.get(&r.note_id) {
            map.entry(*deck_id).or_default().record(r.quality);
        }
    }
    map
}
