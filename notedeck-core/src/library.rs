//! Deck and note operations on behalf of a user.
//!
//! Every mutating call checks that `user` authored the deck involved, then
//! goes through the [`Repository`] port. Reviews are a read-schedule-write
//! cycle guarded by the store's optimistic `apply_review`.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    scheduler, CoreError, Deck, DeckId, NewNote, Note, NoteId, Quality, Repository, Review,
    ScheduledReview,
};

const REVIEW_ATTEMPTS: usize = 3;

fn require_text(s: &str, what: &'static str) -> Result<(), CoreError> {
    if s.trim().is_empty() {
        Err(CoreError::Invalid(what))
    } else {
        Ok(())
    }
}

/// Loads a deck and checks that `user` may modify it.
pub async fn owned_deck<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    deck_id: DeckId,
) -> Result<Deck, CoreError> {
    let deck = repo.get_deck(deck_id).await?;
    if !deck.is_owned_by(user) {
        return Err(CoreError::Forbidden("deck belongs to another user"));
    }
    Ok(deck)
}

/// Loads a note and checks that `user` owns its deck.
pub async fn owned_note<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    note_id: NoteId,
) -> Result<Note, CoreError> {
    let note = repo.get_note(note_id).await?;
    owned_deck(repo, user, note.deck_id).await?;
    Ok(note)
}

pub async fn create_deck<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    name: &str,
) -> Result<Deck, CoreError> {
    require_text(name, "deck name must not be empty")?;
    let deck = repo.create_deck(user, name.trim()).await?;
    debug!(deck = %deck.id, user, "created deck");
    Ok(deck)
}

pub async fn rename_deck<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    deck_id: DeckId,
    name: &str,
) -> Result<Deck, CoreError> {
    require_text(name, "deck name must not be empty")?;
    let mut deck = owned_deck(repo, user, deck_id).await?;
    deck.name = name.trim().to_string();
    repo.update_deck(&deck).await
}

pub async fn describe_deck<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    deck_id: DeckId,
    description: &str,
) -> Result<Deck, CoreError> {
    let mut deck = owned_deck(repo, user, deck_id).await?;
    deck.description = description.trim().to_string();
    repo.update_deck(&deck).await
}

pub async fn delete_deck<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    deck_id: DeckId,
) -> Result<(), CoreError> {
    owned_deck(repo, user, deck_id).await?;
    repo.delete_deck(deck_id).await?;
    debug!(deck = %deck_id, user, "deleted deck");
    Ok(())
}

pub async fn add_note<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    deck_id: DeckId,
    new: NewNote,
) -> Result<Note, CoreError> {
    require_text(&new.book_name, "book name must not be empty")?;
    require_text(&new.content, "note content must not be empty")?;
    owned_deck(repo, user, deck_id).await?;
    let note = Note::new(deck_id, new);
    repo.insert_note(&note).await?;
    debug!(note = %note.id, deck = %deck_id, "added note");
    Ok(note)
}

/// Replaces a note's text, keeping the old text in its history. Review
/// state is left untouched.
pub async fn edit_note<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    note_id: NoteId,
    content: &str,
) -> Result<Note, CoreError> {
    require_text(content, "note content must not be empty")?;
    let mut note = owned_note(repo, user, note_id).await?;
    note.content.revise(content);
    repo.update_note(&note).await
}

pub async fn delete_note<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    note_id: NoteId,
) -> Result<(), CoreError> {
    owned_note(repo, user, note_id).await?;
    repo.delete_note(note_id).await
}

/// Grades a review of `note_id` at `now` and persists the new schedule
/// together with its log entry.
///
/// A concurrent review of the same note surfaces as a store conflict; the
/// note is re-read and rescheduled, up to `REVIEW_ATTEMPTS` times.
pub async fn review_note<R: Repository + ?Sized>(
    repo: &R,
    user: &str,
    note_id: NoteId,
    quality: Quality,
    now: DateTime<Utc>,
) -> Result<ScheduledReview, CoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let note = owned_note(repo, user, note_id).await?;
        if note.review.last_reviewed.is_some_and(|last| now < last) {
            return Err(CoreError::Invalid("review time precedes the last review"));
        }

        let prior = note.review.review_count;
        let scheduled = scheduler::schedule(quality, now, prior);
        let review = Review::new(
            note_id,
            quality,
            now,
            scheduler::days_until_review(quality),
        );
        match repo.apply_review(note_id, prior, &scheduled, &review).await {
            Ok(_) => {
                debug!(
                    note = %note_id,
                    %quality,
                    review_count = scheduled.review_count,
                    next = %scheduled.next_review_date,
                    "reviewed note"
                );
                return Ok(scheduled);
            }
            Err(CoreError::Conflict(reason)) if attempt < REVIEW_ATTEMPTS => {
                warn!(note = %note_id, attempt, reason, "review conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
