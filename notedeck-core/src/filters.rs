use crate::{DueStatus, Note};
use chrono::{DateTime, Utc};

pub fn filter_by_text(notes: &[Note], query: &str) -> Vec<Note> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return notes.to_vec();
    }
    notes
        .iter()
        .filter(|n| {
            n.content.latest.to_lowercase().contains(&q)
                || n.book_name.to_lowercase().contains(&q)
                || n.book_detail
                    .as_ref()
                    .map(|d| d.to_lowercase().contains(&q))
                    .unwrap_or(false)
        })
        .cloned()
        .collect()
}

pub fn filter_by_book(notes: &[Note], book: &str) -> Vec<Note> {
    let q = book.trim().to_lowercase();
    notes
        .iter()
        .filter(|n| n.book_name.to_lowercase() == q || n.book_id.to_lowercase() == q)
        .cloned()
        .collect()
}

pub fn filter_by_due(notes: &[Note], now: DateTime<Utc>, want: DueStatus) -> Vec<Note> {
    notes
        .iter()
        .filter(|n| n.due_status(now) == want)
        .cloned()
        .collect()
}

/// Orders notes for a review session: by next review date, then last
/// review, with never-reviewed notes first. Ties go to the older note.
pub fn review_order(notes: &mut [Note]) {
    notes.sort_by_key(|n| {
        let key = n
            .review
            .next_review_date
            .or(n.review.last_reviewed)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        (key, n.created_at)
    });
}

#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub include_new: bool,
    pub include_lapsed: bool,
    pub max: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            include_new: true,
            include_lapsed: true,
            max: None,
        }
    }
}

/// Notes to present in a review session, in review order.
pub fn due_queue(notes: &[Note], now: DateTime<Utc>, opts: &QueueOptions) -> Vec<Note> {
    let mut pool = Vec::new();
    if opts.include_new {
        pool.extend(filter_by_due(notes, now, DueStatus::New));
    }
    pool.extend(filter_by_due(notes, now, DueStatus::DueToday));
    if opts.include_lapsed {
        pool.extend(filter_by_due(notes, now, DueStatus::Lapsed));
    }
    review_order(&mut pool);
    if let Some(m) = opts.max {
        pool.truncate(m);
    }
    pool
}
