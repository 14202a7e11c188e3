use crate::{
    CoreError, Deck, DeckId, ListingId, Note, NoteId, Purchase, Rating, Review, ScheduledReview,
    StoreDeck,
};
use async_trait::async_trait;

pub mod memory;

/// Persistence port. Implementations store entities as given; ownership and
/// validation live in the service layer.
#[async_trait]
pub trait Repository: Send + Sync {
    // Decks
    async fn create_deck(&self, author: &str, name: &str) -> Result<Deck, CoreError>;
    async fn get_deck(&self, id: DeckId) -> Result<Deck, CoreError>;
    async fn list_decks(&self, author: Option<&str>) -> Result<Vec<Deck>, CoreError>;
    async fn update_deck(&self, deck: &Deck) -> Result<Deck, CoreError>;
    async fn delete_deck(&self, id: DeckId) -> Result<(), CoreError>;

    // Notes
    async fn insert_note(&self, note: &Note) -> Result<(), CoreError>;
    async fn get_note(&self, id: NoteId) -> Result<Note, CoreError>;
    async fn list_notes(&self, deck_id: Option<DeckId>) -> Result<Vec<Note>, CoreError>;
    async fn update_note(&self, note: &Note) -> Result<Note, CoreError>;
    async fn delete_note(&self, id: NoteId) -> Result<(), CoreError>;

    /// Writes a scheduling decision and appends `review` to the log as one
    /// unit, only if the stored `review_count` still equals
    /// `expected_review_count`; otherwise `CoreError::Conflict`. On any
    /// error neither the note nor the log changes.
    async fn apply_review(
        &self,
        note_id: NoteId,
        expected_review_count: u32,
        scheduled: &ScheduledReview,
        review: &Review,
    ) -> Result<Note, CoreError>;

    // Reviews
    /// Appends a log entry without touching the note. Used by import.
    async fn insert_review(&self, review: &Review) -> Result<(), CoreError>;
    async fn list_reviews_for_note(&self, note_id: NoteId) -> Result<Vec<Review>, CoreError>;
    async fn list_reviews(&self) -> Result<Vec<Review>, CoreError>;

    // Marketplace
    async fn insert_listing(&self, listing: &StoreDeck) -> Result<(), CoreError>;
    async fn get_listing(&self, id: ListingId) -> Result<StoreDeck, CoreError>;
    async fn list_listings(&self) -> Result<Vec<StoreDeck>, CoreError>;
    async fn update_listing(&self, listing: &StoreDeck) -> Result<StoreDeck, CoreError>;
    async fn delete_listing(&self, id: ListingId) -> Result<(), CoreError>;

    /// Records a rating and folds it into the listing's aggregate.
    /// A second rating by the same user is `CoreError::Conflict`.
    async fn insert_rating(&self, rating: &Rating) -> Result<(), CoreError>;
    async fn list_ratings(&self, listing_id: ListingId) -> Result<Vec<Rating>, CoreError>;

    /// Records a purchase and bumps the listing's purchase count.
    /// A repeated purchase by the same user is `CoreError::Conflict`.
    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), CoreError>;
    async fn list_purchases(&self, user: &str) -> Result<Vec<Purchase>, CoreError>;
}
