use crate::{
    CoreError, Deck, DeckId, ListingId, Note, NoteId, Purchase, Rating, Review, ReviewState,
    ScheduledReview, StoreDeck,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct MemoryRepo {
    decks: RwLock<HashMap<DeckId, Deck>>,
    notes: RwLock<HashMap<NoteId, Note>>,
    reviews: RwLock<HashMap<NoteId, Vec<Review>>>,
    listings: RwLock<HashMap<ListingId, StoreDeck>>,
    ratings: RwLock<Vec<Rating>>,
    purchases: RwLock<Vec<Purchase>>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::repo::Repository for MemoryRepo {
    async fn create_deck(&self, author: &str, name: &str) -> Result<Deck, CoreError> {
        let deck = Deck::new(author, name);
        let mut m = self.decks.write();
        if m
            .values()
            .any(|d| d.author == author && d.has_name(name))
        {
            return Err(CoreError::Conflict("deck name already exists"));
        }
        m.insert(deck.id, deck.clone());
        Ok(deck)
    }

    async fn get_deck(&self, id: DeckId) -> Result<Deck, CoreError> {
        self.decks
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound("deck"))
    }

    async fn list_decks(&self, author: Option<&str>) -> Result<Vec<Deck>, CoreError> {
        let mut v: Vec<Deck> = self.decks.read().values().cloned().collect();
        if let Some(a) = author {
            v.retain(|d| d.author == a);
        }
        v.sort_by_key(|d| d.created_at);
        Ok(v)
    }

    async fn update_deck(&self, deck: &Deck) -> Result<Deck, CoreError> {
        let mut m = self.decks.write();
        if !m.contains_key(&deck.id) {
            return Err(CoreError::NotFound("deck"));
        }
        if m.values().any(|d| {
            d.id != deck.id && d.author == deck.author && d.has_name(&deck.name)
        }) {
            return Err(CoreError::Conflict("deck name already exists"));
        }
        m.insert(deck.id, deck.clone());
        Ok(deck.clone())
    }

    async fn delete_deck(&self, id: DeckId) -> Result<(), CoreError> {
        self.decks
            .write()
            .remove(&id)
            .ok_or(CoreError::NotFound("deck"))?;
        let mut notes = self.notes.write();
        let ids: Vec<NoteId> = notes
            .values()
            .filter(|n| n.deck_id == id)
            .map(|n| n.id)
            .collect();
        let mut reviews = self.reviews.write();
        for nid in ids {
            notes.remove(&nid);
            reviews.remove(&nid);
        }
        Ok(())
    }

    async fn insert_note(&self, note: &Note) -> Result<(), CoreError> {
        if !self.decks.read().contains_key(&note.deck_id) {
            return Err(CoreError::NotFound("deck"));
        }
        self.notes.write().insert(note.id, note.clone());
        Ok(())
    }

    async fn get_note(&self, id: NoteId) -> Result<Note, CoreError> {
        self.notes
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound("note"))
    }

    async fn list_notes(&self, deck_id: Option<DeckId>) -> Result<Vec<Note>, CoreError> {
        let mut v: Vec<Note> = self.notes.read().values().cloned().collect();
        if let Some(did) = deck_id {
            v.retain(|n| n.deck_id == did);
        }
        v.sort_by_key(|n| n.created_at);
        Ok(v)
    }

    async fn update_note(&self, note: &Note) -> Result<Note, CoreError> {
        let mut m = self.notes.write();
        if !m.contains_key(&note.id) {
            return Err(CoreError::NotFound("note"));
        }
        m.insert(note.id, note.clone());
        Ok(note.clone())
    }

    async fn delete_note(&self, id: NoteId) -> Result<(), CoreError> {
        self.notes
            .write()
            .remove(&id)
            .ok_or(CoreError::NotFound("note"))?;
        self.reviews.write().remove(&id);
        Ok(())
    }

    async fn apply_review(
        &self,
        note_id: NoteId,
        expected_review_count: u32,
        scheduled: &ScheduledReview,
        review: &Review,
    ) -> Result<Note, CoreError> {
        let mut m = self.notes.write();
        let Some(note) = m.get_mut(&note_id) else {
            return Err(CoreError::NotFound("note"));
        };
        if note.review.review_count != expected_review_count {
            return Err(CoreError::Conflict("note was reviewed concurrently"));
        }
        // Notes lock is held so the log entry lands with the state change.
        self.reviews
            .write()
            .entry(note_id)
            .or_default()
            .push(review.clone());
        note.review = ReviewState::from(scheduled.clone());
        Ok(note.clone())
    }

    async fn insert_review(&self, review: &Review) -> Result<(), CoreError> {
        let mut m = self.reviews.write();
        m.entry(review.note_id).or_default().push(review.clone());
        Ok(())
    }

    async fn list_reviews_for_note(&self, note_id: NoteId) -> Result<Vec<Review>, CoreError> {
        Ok(self
            .reviews
            .read()
            .get(&note_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_reviews(&self) -> Result<Vec<Review>, CoreError> {
        let mut v: Vec<Review> = self.reviews.read().values().flatten().cloned().collect();
        v.sort_by_key(|r| r.reviewed_at);
        Ok(v)
    }

    async fn insert_listing(&self, listing: &StoreDeck) -> Result<(), CoreError> {
        self.listings.write().insert(listing.id, listing.clone());
        Ok(())
    }

    async fn get_listing(&self, id: ListingId) -> Result<StoreDeck, CoreError> {
        self.listings
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound("listing"))
    }

    async fn list_listings(&self) -> Result<Vec<StoreDeck>, CoreError> {
        let mut v: Vec<StoreDeck> = self.listings.read().values().cloned().collect();
        v.sort_by_key(|l| l.listed_at);
        Ok(v)
    }

    async fn update_listing(&self, listing: &StoreDeck) -> Result<StoreDeck, CoreError> {
        let mut m = self.listings.write();
        if !m.contains_key(&listing.id) {
            return Err(CoreError::NotFound("listing"));
        }
        m.insert(listing.id, listing.clone());
        Ok(listing.clone())
    }

    async fn delete_listing(&self, id: ListingId) -> Result<(), CoreError> {
        self.listings
            .write()
            .remove(&id)
            .ok_or(CoreError::NotFound("listing"))?;
        self.ratings.write().retain(|r| r.listing_id != id);
        Ok(())
    }

    async fn insert_rating(&self, rating: &Rating) -> Result<(), CoreError> {
        let mut listings = self.listings.write();
        let Some(listing) = listings.get_mut(&rating.listing_id) else {
            return Err(CoreError::NotFound("listing"));
        };
        let mut ratings = self.ratings.write();
        if ratings
            .iter()
            .any(|r| r.listing_id == rating.listing_id && r.user_id == rating.user_id)
        {
            return Err(CoreError::Conflict("listing already rated by this user"));
        }
        listing.rating_sum += rating.rating as u32;
        listing.rating_count += 1;
        ratings.push(rating.clone());
        Ok(())
    }

    async fn list_ratings(&self, listing_id: ListingId) -> Result<Vec<Rating>, CoreError> {
        Ok(self
            .ratings
            .read()
            .iter()
            .filter(|r| r.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), CoreError> {
        let mut listings = self.listings.write();
        let Some(listing) = listings.get_mut(&purchase.listing_id) else {
            return Err(CoreError::NotFound("listing"));
        };
        let mut purchases = self.purchases.write();
        if purchases
            .iter()
            .any(|p| p.user_id == purchase.user_id && p.listing_id == purchase.listing_id)
        {
            return Err(CoreError::Conflict("already purchased"));
        }
        listing.purchase_count += 1;
        purchases.push(purchase.clone());
        Ok(())
    }

    async fn list_purchases(&self, user: &str) -> Result<Vec<Purchase>, CoreError> {
        Ok(self
            .purchases
            .read()
            .iter()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect())
    }
}
