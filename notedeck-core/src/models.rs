use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

pub type DeckId = Uuid;
pub type NoteId = Uuid;
pub type ReviewId = Uuid;
pub type ListingId = Uuid;
pub type RatingId = Uuid;
pub type UserId = String;

pub const QUALITY_MIN: u8 = 0;
pub const QUALITY_MAX: u8 = 5;
pub const RATING_MIN: u8 = 1;
pub const RATING_MAX: u8 = 5;
pub const PREVIEW_NOTES_MAX: usize = 3;

/// Self-reported recall rating, 0 (blackout) to 5 (trivial).
///
/// Only constructible through validation, so a `Quality` in hand is always
/// within `QUALITY_MIN..=QUALITY_MAX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: i64) -> Result<Self, CoreError> {
        if (QUALITY_MIN as i64..=QUALITY_MAX as i64).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(CoreError::InvalidQuality(value.to_string()))
        }
    }

    /// Rejects NaN, infinities and fractional ratings instead of truncating.
    pub fn from_f64(value: f64) -> Result<Self, CoreError> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(CoreError::InvalidQuality(value.to_string()));
        }
        if value < QUALITY_MIN as f64 || value > QUALITY_MAX as f64 {
            return Err(CoreError::InvalidQuality(value.to_string()));
        }
        Ok(Self(value as u8))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// 0 and 1 count as a failed recall.
    pub fn is_failure(self) -> bool {
        self.0 <= 1
    }

    pub fn all() -> impl Iterator<Item = Quality> {
        (QUALITY_MIN..=QUALITY_MAX).map(Quality)
    }
}

impl TryFrom<i64> for Quality {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Quality::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(q: Quality) -> Self {
        q.0
    }
}

impl FromStr for Quality {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        match t.parse::<i64>() {
            Ok(v) => Quality::new(v),
            Err(_) => Err(CoreError::InvalidQuality(t.to_string())),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DueStatus {
    New,
    DueToday,
    Lapsed,
    Future,
}

/// Review bookkeeping carried by every note. All fields are absent on a
/// freshly created note.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewState {
    #[serde(default)]
    pub review_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review_date: Option<DateTime<Utc>>,
}

/// The fully populated state produced by one scheduling decision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledReview {
    pub review_count: u32,
    pub last_reviewed: DateTime<Utc>,
    pub next_review_date: DateTime<Utc>,
}

impl ReviewState {
    /// True when the fields could have come out of the scheduler: either a
    /// never-reviewed state, or a counted review with a next date at least
    /// one day after the last one.
    pub fn is_consistent(&self) -> bool {
        match (self.review_count, self.last_reviewed, self.next_review_date) {
            (0, None, None) => true,
            (n, Some(last), Some(next)) if n > 0 => next >= last + Duration::days(1),
            _ => false,
        }
    }
}

impl From<ScheduledReview> for ReviewState {
    fn from(s: ScheduledReview) -> Self {
        Self {
            review_count: s.review_count,
            last_reviewed: Some(s.last_reviewed),
            next_review_date: Some(s.next_review_date),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deck {
    pub id: DeckId,
    pub name: String,
    pub author: UserId,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Deck {
    pub fn new(author: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            author: author.into(),
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, user: &str) -> bool {
        self.author == user
    }

    /// Deck names compare case-insensitively, including non-ASCII letters.
    pub fn has_name(&self, name: &str) -> bool {
        self.name.trim().to_lowercase() == name.trim().to_lowercase()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteContent {
    pub latest: String,
    #[serde(default)]
    pub history: Vec<String>,
}

impl NoteContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            latest: text.into(),
            history: Vec::new(),
        }
    }

    /// Replaces the text, keeping the previous version in `history`.
    pub fn revise(&mut self, text: impl Into<String>) {
        let prev = std::mem::replace(&mut self.latest, text.into());
        self.history.push(prev);
    }
}

/// Fields supplied by the user when adding a note to a deck.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewNote {
    pub book_id: String,
    pub book_name: String,
    pub book_detail: Option<String>,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub id: NoteId,
    pub deck_id: DeckId,
    pub book_id: String,
    pub book_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_detail: Option<String>,
    pub content: NoteContent,
    #[serde(flatten)]
    pub review: ReviewState,
    pub created_at: DateTime<Utc>,
}

impl Note {
    pub fn new(deck_id: DeckId, new: NewNote) -> Self {
        Self {
            id: Uuid::new_v4(),
            deck_id,
            book_id: new.book_id,
            book_name: new.book_name,
            book_detail: new.book_detail,
            content: NoteContent::new(new.content),
            review: ReviewState::default(),
            created_at: Utc::now(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.review.review_count == 0
    }

    pub fn due_status(&self, now: DateTime<Utc>) -> DueStatus {
        let Some(due_at) = self.review.next_review_date else {
            return DueStatus::New;
        };
        if self.is_new() {
            DueStatus::New
        } else if due_at > now {
            DueStatus::Future
        } else if (now - due_at).num_hours() >= 24 {
            DueStatus::Lapsed
        } else {
            DueStatus::DueToday
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_status(now) != DueStatus::Future
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Review {
    pub id: ReviewId,
    pub note_id: NoteId,
    pub quality: Quality,
    pub reviewed_at: DateTime<Utc>,
    pub interval_days: u32,
}

impl Review {
    pub fn new(
        note_id: NoteId,
        quality: Quality,
        reviewed_at: DateTime<Utc>,
        interval_days: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            note_id,
            quality,
            reviewed_at,
            interval_days,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewNote {
    pub book_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_detail: Option<String>,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BookRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A deck offered on the marketplace. Listing data is a snapshot taken when
/// the deck is put up for sale.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreDeck {
    pub id: ListingId,
    pub deck_id: DeckId,
    pub deck_name: String,
    pub author: UserId,
    pub description: String,
    pub price_cents: u64,
    pub purchase_count: u32,
    pub rating_sum: u32,
    pub rating_count: u32,
    pub note_count: u32,
    pub preview_notes: Vec<PreviewNote>,
    pub referenced_books: Vec<BookRef>,
    pub listed_at: DateTime<Utc>,
}

impl StoreDeck {
    pub fn average_rating(&self) -> f32 {
        if self.rating_count == 0 {
            0.0
        } else {
            self.rating_sum as f32 / self.rating_count as f32
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rating {
    pub id: RatingId,
    pub listing_id: ListingId,
    pub user_id: UserId,
    pub rating: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Rating {
    pub fn new(
        listing_id: ListingId,
        user_id: impl Into<UserId>,
        rating: u8,
        review: Option<String>,
    ) -> Result<Self, CoreError> {
        if !(RATING_MIN..=RATING_MAX).contains(&rating) {
            return Err(CoreError::Invalid("rating must be between 1 and 5"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            listing_id,
            user_id: user_id.into(),
            rating,
            review,
            created_at: Utc::now(),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Purchase {
    pub user_id: UserId,
    pub listing_id: ListingId,
    pub purchased_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_bounds() {
        assert!(Quality::new(0).is_ok());
        assert!(Quality::new(5).is_ok());
        assert_eq!(
            Quality::new(6),
            Err(CoreError::InvalidQuality("6".into()))
        );
        assert!(Quality::new(-1).is_err());
    }

    #[test]
    fn quality_from_float_and_text() {
        assert_eq!(Quality::from_f64(3.0).map(Quality::value), Ok(3));
        assert!(Quality::from_f64(2.5).is_err());
        assert!(Quality::from_f64(f64::NAN).is_err());
        assert!(Quality::from_f64(f64::INFINITY).is_err());
        assert_eq!(" 4 ".parse::<Quality>().map(Quality::value), Ok(4));
        assert!("easy".parse::<Quality>().is_err());
    }

    #[test]
    fn quality_rejected_on_deserialize() {
        let ok: Quality = serde_json::from_str("2").unwrap();
        assert_eq!(ok.value(), 2);
        assert!(serde_json::from_str::<Quality>("9").is_err());
    }

    #[test]
    fn note_round_trips_flat_review_fields() {
        let deck = Deck::new("ann", "Stoics");
        let note = Note::new(
            deck.id,
            NewNote {
                book_id: "b1".into(),
                book_name: "Meditations".into(),
                book_detail: None,
                content: "You have power over your mind".into(),
            },
        );
        let v = serde_json::to_value(&note).unwrap();
        assert_eq!(v["review_count"], 0);
        assert!(v.get("last_reviewed").is_none());
        let back: Note = serde_json::from_value(v).unwrap();
        assert_eq!(back, note);
    }

    #[test]
    fn revise_keeps_history() {
        let mut c = NoteContent::new("a");
        c.revise("b");
        c.revise("c");
        assert_eq!(c.latest, "c");
        assert_eq!(c.history, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn review_state_consistency() {
        let t = Utc::now();
        assert!(ReviewState::default().is_consistent());
        assert!(ReviewState::from(crate::schedule(Quality::new(5).unwrap(), t, 0)).is_consistent());

        let backwards = ReviewState {
            review_count: 3,
            last_reviewed: Some(t),
            next_review_date: Some(t - Duration::days(120)),
        };
        assert!(!backwards.is_consistent());
        let uncounted = ReviewState {
            review_count: 0,
            last_reviewed: Some(t),
            next_review_date: Some(t + Duration::days(2)),
        };
        assert!(!uncounted.is_consistent());
    }

    #[test]
    fn deck_names_fold_unicode_case() {
        let deck = Deck::new("ann", "Ärzte und Öl");
        assert!(deck.has_name("ärzte und öl"));
        assert!(deck.has_name(" ÄRZTE UND ÖL "));
        assert!(!deck.has_name("Arzte und Ol"));
    }
}
