use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::library::owned_deck;
use crate::{
    BookRef, CoreError, DeckId, ListingId, Note, PreviewNote, Purchase, Rating, Repository,
    StoreDeck, PREVIEW_NOTES_MAX,
};

/// Distinct books referenced by `notes`, in first-seen order.
pub fn referenced_books(notes: &[Note]) -> Vec<BookRef> {
    let mut books: Vec<BookRef> = Vec::new();
    for n in notes {
        let b = BookRef {
            name: n.book_name.clone(),
            detail: n.book_detail.clone(),
        };
        if !books.contains(&b) {
            books.push(b);
        }
    }
    books
}

pub fn preview_notes(notes: &[Note]) -> Vec<PreviewNote> {
    notes
        .iter()
        .take(PREVIEW_NOTES_MAX)
        .map(|n| PreviewNote {
            book_name: n.book_name.clone(),
            book_detail: n.book_detail.clone(),
            content: n.content.latest.clone(),
        })
        .collect()
}

async fn authored_listing<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    id: ListingId,
) -> Result<StoreDeck, CoreError> {
    let listing = repo.get_listing(id).await?;
    if listing.author != user {
        return Err(CoreError::Forbidden("listing belongs to another user"));
    }
    Ok(listing)
}

/// Puts a snapshot of the deck up for sale.
pub async fn list_for_sale<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    deck_id: DeckId,
    price_cents: u64,
    description: &str,
) -> Result<StoreDeck, CoreError> {
    let deck = owned_deck(repo, user, deck_id).await?;
    let notes = repo.list_notes(Some(deck_id)).await?;

    let listing = StoreDeck {
        id: Uuid::new_v4(),
        deck_id,
        deck_name: deck.name,
        author: user.to_string(),
        description: description.trim().to_string(),
        price_cents,
        purchase_count: 0,
        rating_sum: 0,
        rating_count: 0,
        note_count: notes.len() as u32,
        preview_notes: preview_notes(&notes),
        referenced_books: referenced_books(&notes),
        listed_at: Utc::now(),
    };
    repo.insert_listing(&listing).await?;
    debug!(listing = %listing.id, deck = %deck_id, price_cents, "listed deck");
    Ok(listing)
}

pub async fn unlist<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    id: ListingId,
) -> Result<(), CoreError> {
    authored_listing(repo, user, id).await?;
    repo.delete_listing(id).await
}

pub async fn update_price<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    id: ListingId,
    price_cents: u64,
) -> Result<StoreDeck, CoreError> {
    let mut listing = authored_listing(repo, user, id).await?;
    listing.price_cents = price_cents;
    repo.update_listing(&listing).await
}

pub async fn purchase<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    id: ListingId,
) -> Result<Purchase, CoreError> {
    let listing = repo.get_listing(id).await?;
    if listing.author == user {
        return Err(CoreError::Invalid("cannot purchase your own listing"));
    }
    let p = Purchase {
        user_id: user.to_string(),
        listing_id: id,
        purchased_at: Utc::now(),
    };
    repo.insert_purchase(&p).await?;
    debug!(listing = %id, user, "purchased listing");
    Ok(p)
}

/// Rates a listing the user has bought. Ratings are 1 to 5, one per buyer.
pub async fn rate<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    id: ListingId,
    rating: u8,
    review: Option<String>,
) -> Result<Rating, CoreError> {
    let r = Rating::new(id, user, rating, review.filter(|s| !s.trim().is_empty()))?;
    repo.get_listing(id).await?;
    let bought = repo
        .list_purchases(user)
        .await?
        .iter()
        .any(|p| p.listing_id == id);
    if !bought {
        return Err(CoreError::Forbidden("only buyers can rate a listing"));
    }
    repo.insert_rating(&r).await?;
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Deck, NewNote};

    fn note(deck: &Deck, book: &str, detail: Option<&str>, text: &str) -> Note {
        Note::new(
            deck.id,
            NewNote {
                book_id: book.to_lowercase(),
                book_name: book.into(),
                book_detail: detail.map(String::from),
                content: text.into(),
            },
        )
    }

    #[test]
    fn books_deduplicated_in_first_seen_order() {
        let deck = Deck::new("ann", "D");
        let notes = vec![
            note(&deck, "Walden", None, "a"),
            note(&deck, "Meditations", Some("II"), "b"),
            note(&deck, "Walden", None, "c"),
            note(&deck, "Meditations", Some("IV"), "d"),
        ];
        let books = referenced_books(&notes);
        assert_eq!(books.len(), 3);
        assert_eq!(books[0].name, "Walden");
        assert_eq!(books[2].detail.as_deref(), Some("IV"));

        let preview = preview_notes(&notes);
        let texts: Vec<&str> = preview.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }
}
