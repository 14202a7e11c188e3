use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notedeck_core::{
    repo::Repository, CoreError, Deck, DeckId, ListingId, Note, NoteId, Purchase, Rating, Review,
    ReviewState, ScheduledReview, StoreDeck,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::{sync::Mutex, task};
use tracing::{debug, warn};

pub mod paths;

const FILE_VERSION: u32 = 1;

#[derive(Clone, Serialize, Deserialize)]
struct FileImage {
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    decks: Vec<Deck>,
    notes: Vec<Note>,
    reviews: Vec<Review>,
    #[serde(default)]
    listings: Vec<StoreDeck>,
    #[serde(default)]
    ratings: Vec<Rating>,
    #[serde(default)]
    purchases: Vec<Purchase>,
}

#[derive(Clone)]
struct State {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    decks: HashMap<DeckId, Deck>,
    notes: HashMap<NoteId, Note>,
    reviews: HashMap<NoteId, Vec<Review>>,
    listings: HashMap<ListingId, StoreDeck>,
    ratings: Vec<Rating>,
    purchases: Vec<Purchase>,
}

impl State {
    fn new_empty() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            decks: HashMap::new(),
            notes: HashMap::new(),
            reviews: HashMap::new(),
            listings: HashMap::new(),
            ratings: Vec::new(),
            purchases: Vec::new(),
        }
    }

    fn to_image(&self) -> FileImage {
        let mut decks: Vec<Deck> = self.decks.values().cloned().collect();
        decks.sort_by_key(|d| d.created_at);
        let mut notes: Vec<Note> = self.notes.values().cloned().collect();
        notes.sort_by_key(|n| n.created_at);
        let mut reviews: Vec<Review> = self.reviews.values().flatten().cloned().collect();
        reviews.sort_by_key(|r| r.reviewed_at);
        let mut listings: Vec<StoreDeck> = self.listings.values().cloned().collect();
        listings.sort_by_key(|l| l.listed_at);
        FileImage {
            version: FILE_VERSION,
            created_at: self.created_at,
            updated_at: self.updated_at,
            decks,
            notes,
            reviews,
            listings,
            ratings: self.ratings.clone(),
            purchases: self.purchases.clone(),
        }
    }

    fn from_image(img: FileImage) -> Self {
        let decks = img.decks.into_iter().map(|d| (d.id, d)).collect();
        let notes = img.notes.into_iter().map(|n| (n.id, n)).collect();
        let mut reviews: HashMap<NoteId, Vec<Review>> = HashMap::new();
        for r in img.reviews {
            reviews.entry(r.note_id).or_default().push(r);
        }
        let listings = img.listings.into_iter().map(|l| (l.id, l)).collect();
        Self {
            created_at: img.created_at,
            updated_at: img.updated_at,
            decks,
            notes,
            reviews,
            listings,
            ratings: img.ratings,
            purchases: img.purchases,
        }
    }

    fn name_taken(&self, author: &str, name: &str, except: Option<DeckId>) -> bool {
        self.decks.values().any(|d| {
            Some(d.id) != except && d.author == author && d.has_name(name)
        })
    }
}

/// Whole-library JSON file. Every mutation rewrites the file atomically and
/// drops a timestamped copy into the backup directory.
pub struct JsonStore {
    path: PathBuf,
    backups_dir: PathBuf,
    max_backups: usize,
    state: RwLock<State>,
    // Held from snapshot to rename so images reach disk in mutation order.
    write_order: Mutex<()>,
}

impl JsonStore {
    pub async fn open_default() -> Result<Self, CoreError> {
        let (file, backups) = paths::default_store_file();
        Self::open_with(file, backups, 10).await
    }

    pub async fn open_in(root: &Path) -> Result<Self, CoreError> {
        let (file, backups) = paths::store_file_in(root);
        Self::open_with(file, backups, 10).await
    }

    pub async fn open_with(
        path: PathBuf,
        backups_dir: PathBuf,
        max_backups: usize,
    ) -> Result<Self, CoreError> {
        ensure_parent_dirs(&path)?;
        ensure_dir(&backups_dir)?;
        let state = load_or_init(&path, &backups_dir).await?;
        debug!(path = %path.display(), "opened json store");
        Ok(Self {
            path,
            backups_dir,
            max_backups: max_backups.max(1),
            state: RwLock::new(state),
            write_order: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self) -> Result<(), CoreError> {
        let _order = self.write_order.lock().await;
        let snapshot = {
            let mut s = self.state.write();
            s.updated_at = Utc::now();
            s.to_image()
        };
        let path = self.path.clone();
        let backups = self.backups_dir.clone();
        let keep = self.max_backups;

        task::spawn_blocking(move || write_with_backup(&path, &backups, keep, &snapshot))
            .await
            .map_err(|_| CoreError::Storage("io"))?
            .map_err(|e| {
                warn!(error = %e, "json store write failed");
                CoreError::Storage("io")
            })
    }
}

fn ensure_parent_dirs(path: &Path) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<(), CoreError> {
    fs::create_dir_all(path).map_err(|_| CoreError::Storage("io"))
}

async fn load_or_init(path: &Path, backups_dir: &Path) -> Result<State, CoreError> {
    if path.exists() {
        let p = path.to_path_buf();
        let img: FileImage = task::spawn_blocking(move || {
            let buf = fs::read_to_string(&p)?;
            let v = serde_json::from_str::<FileImage>(&buf)?;
            Ok::<FileImage, std::io::Error>(v)
        })
        .await
        .map_err(|_| CoreError::Storage("io"))
        .and_then(|r| r.map_err(|_| CoreError::Storage("corrupt json store")))?;
        if img.version > FILE_VERSION {
            return Err(CoreError::Storage("unsupported json store version"));
        }
        Ok(State::from_image(img))
    } else {
        let st = State::new_empty();
        let img = st.to_image();
        write_with_backup(path, backups_dir, 1, &img).map_err(|_| CoreError::Storage("io"))?;
        Ok(st)
    }
}

fn write_with_backup(
    path: &Path,
    backups_dir: &Path,
    max_backups: usize,
    img: &FileImage,
) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::create_dir_all(backups_dir)?;

    let json = serde_json::to_vec_pretty(img)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;

    let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let backup_path = backups_dir.join(format!("notedeck-{ts}.json"));
    let mut btmp = NamedTempFile::new_in(backups_dir)?;
    btmp.write_all(&json)?;
    btmp.flush()?;
    btmp.persist(&backup_path).map_err(|e| e.error)?;

    rotate_backups(backups_dir, max_backups)
}

fn rotate_backups(dir: &Path, keep: usize) -> Result<(), std::io::Error> {
    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    if entries.len() > keep {
        for e in &entries[0..entries.len() - keep] {
            let _ = fs::remove_file(e.path());
        }
    }
    Ok(())
}

#[async_trait]
impl Repository for JsonStore {
    async fn create_deck(&self, author: &str, name: &str) -> Result<Deck, CoreError> {
        let deck = Deck::new(author, name);
        {
            let mut s = self.state.write();
            if s.name_taken(author, name, None) {
                return Err(CoreError::Conflict("deck name already exists"));
            }
            s.decks.insert(deck.id, deck.clone());
        }
        self.save().await?;
        Ok(deck)
    }

    async fn get_deck(&self, id: DeckId) -> Result<Deck, CoreError> {
        let s = self.state.read();
        s.decks.get(&id).cloned().ok_or(CoreError::NotFound("deck"))
    }

    async fn list_decks(&self, author: Option<&str>) -> Result<Vec<Deck>, CoreError> {
        let s = self.state.read();
        let mut v: Vec<Deck> = s
            .decks
            .values()
            .filter(|d| author.map_or(true, |a| d.author == a))
            .cloned()
            .collect();
        v.sort_by_key(|d| d.created_at);
        Ok(v)
    }

    async fn update_deck(&self, deck: &Deck) -> Result<Deck, CoreError> {
        {
            let mut s = self.state.write();
            if !s.decks.contains_key(&deck.id) {
                return Err(CoreError::NotFound("deck"));
            }
            if s.name_taken(&deck.author, &deck.name, Some(deck.id)) {
                return Err(CoreError::Conflict("deck name already exists"));
            }
            s.decks.insert(deck.id, deck.clone());
        }
        self.save().await?;
        Ok(deck.clone())
    }

    async fn delete_deck(&self, id: DeckId) -> Result<(), CoreError> {
        {
            let mut s = self.state.write();
            if s.decks.remove(&id).is_none() {
                return Err(CoreError::NotFound("deck"));
            }
            let to_remove: Vec<NoteId> = s
                .notes
                .values()
                .filter(|n| n.deck_id == id)
                .map(|n| n.id)
                .collect();
            for nid in to_remove {
                s.notes.remove(&nid);
                s.reviews.remove(&nid);
            }
        }
        self.save().await
    }

    async fn insert_note(&self, note: &Note) -> Result<(), CoreError> {
        {
            let mut s = self.state.write();
            if !s.decks.contains_key(&note.deck_id) {
                return Err(CoreError::NotFound("deck"));
            }
            s.notes.insert(note.id, note.clone());
        }
        self.save().await
    }

    async fn get_note(&self, id: NoteId) -> Result<Note, CoreError> {
        let s = self.state.read();
        s.notes.get(&id).cloned().ok_or(CoreError::NotFound("note"))
    }

    async fn list_notes(&self, deck_id: Option<DeckId>) -> Result<Vec<Note>, CoreError> {
        let s = self.state.read();
        let mut v: Vec<Note> = s
            .notes
            .values()
            .filter(|n| deck_id.map_or(true, |did| n.deck_id == did))
            .cloned()
            .collect();
        v.sort_by_key(|n| n.created_at);
        Ok(v)
    }

    async fn update_note(&self, note: &Note) -> Result<Note, CoreError> {
        {
            let mut s = self.state.write();
            if !s.notes.contains_key(&note.id) {
                return Err(CoreError::NotFound("note"));
            }
            s.notes.insert(note.id, note.clone());
        }
        self.save().await?;
        Ok(note.clone())
    }

    async fn delete_note(&self, id: NoteId) -> Result<(), CoreError> {
        {
            let mut s = self.state.write();
            if s.notes.remove(&id).is_none() {
                return Err(CoreError::NotFound("note"));
            }
            s.reviews.remove(&id);
        }
        self.save().await
    }

    async fn apply_review(
        &self,
        note_id: NoteId,
        expected_review_count: u32,
        scheduled: &ScheduledReview,
        review: &Review,
    ) -> Result<Note, CoreError> {
        let note = {
            let mut guard = self.state.write();
            let s = &mut *guard;
            let Some(n) = s.notes.get_mut(&note_id) else {
                return Err(CoreError::NotFound("note"));
            };
            if n.review.review_count != expected_review_count {
                return Err(CoreError::Conflict("note was reviewed concurrently"));
            }
            n.review = ReviewState::from(scheduled.clone());
            s.reviews.entry(note_id).or_default().push(review.clone());
            n.clone()
        };
        self.save().await?;
        Ok(note)
    }

    async fn insert_review(&self, review: &Review) -> Result<(), CoreError> {
        {
            let mut s = self.state.write();
            s.reviews
                .entry(review.note_id)
                .or_default()
                .push(review.clone());
        }
        self.save().await
    }

    async fn list_reviews_for_note(&self, note_id: NoteId) -> Result<Vec<Review>, CoreError> {
        let s = self.state.read();
        Ok(s.reviews.get(&note_id).cloned().unwrap_or_default())
    }

    async fn list_reviews(&self) -> Result<Vec<Review>, CoreError> {
        let s = self.state.read();
        let mut v: Vec<Review> = s.reviews.values().flatten().cloned().collect();
        v.sort_by_key(|r| r.reviewed_at);
        Ok(v)
    }

    async fn insert_listing(&self, listing: &StoreDeck) -> Result<(), CoreError> {
        {
            let mut s = self.state.write();
            s.listings.insert(listing.id, listing.clone());
        }
        self.save().await
    }

    async fn get_listing(&self, id: ListingId) -> Result<StoreDeck, CoreError> {
        let s = self.state.read();
        s.listings
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound("listing"))
    }

    async fn list_listings(&self) -> Result<Vec<StoreDeck>, CoreError> {
        let s = self.state.read();
        let mut v: Vec<StoreDeck> = s.listings.values().cloned().collect();
        v.sort_by_key(|l| l.listed_at);
        Ok(v)
    }

    async fn update_listing(&self, listing: &StoreDeck) -> Result<StoreDeck, CoreError> {
        {
            let mut s = self.state.write();
            if !s.listings.contains_key(&listing.id) {
                return Err(CoreError::NotFound("listing"));
            }
            s.listings.insert(listing.id, listing.clone());
        }
        self.save().await?;
        Ok(listing.clone())
    }

    async fn delete_listing(&self, id: ListingId) -> Result<(), CoreError> {
        {
            let mut s = self.state.write();
            if s.listings.remove(&id).is_none() {
                return Err(CoreError::NotFound("listing"));
            }
            s.ratings.retain(|r| r.listing_id != id);
        }
        self.save().await
    }

    async fn insert_rating(&self, rating: &Rating) -> Result<(), CoreError> {
        {
            let mut guard = self.state.write();
            let s = &mut *guard;
            let Some(l) = s.listings.get_mut(&rating.listing_id) else {
                return Err(CoreError::NotFound("listing"));
            };
            if s
                .ratings
                .iter()
                .any(|r| r.listing_id == rating.listing_id && r.user_id == rating.user_id)
            {
                return Err(CoreError::Conflict("listing already rated by this user"));
            }
            l.rating_sum += rating.rating as u32;
            l.rating_count += 1;
            s.ratings.push(rating.clone());
        }
        self.save().await
    }

    async fn list_ratings(&self, listing_id: ListingId) -> Result<Vec<Rating>, CoreError> {
        let s = self.state.read();
        Ok(s.ratings
            .iter()
            .filter(|r| r.listing_id == listing_id)
            .cloned()
            .collect())
    }

    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), CoreError> {
        {
            let mut guard = self.state.write();
            let s = &mut *guard;
            if s.purchases
                .iter()
                .any(|p| p.user_id == purchase.user_id && p.listing_id == purchase.listing_id)
            {
                return Err(CoreError::Conflict("already purchased"));
            }
            let Some(l) = s.listings.get_mut(&purchase.listing_id) else {
                return Err(CoreError::NotFound("listing"));
            };
            l.purchase_count += 1;
            s.purchases.push(purchase.clone());
        }
        self.save().await
    }

    async fn list_purchases(&self, user: &str) -> Result<Vec<Purchase>, CoreError> {
        let s = self.state.read();
        Ok(s.purchases
            .iter()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notedeck_core::{library, market, NewNote, Quality};

    async fn open(dir: &Path) -> JsonStore {
        JsonStore::open_with(dir.join("store.json"), dir.join("backups"), 3)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let (deck_id, note_id) = {
            let store = open(dir.path()).await;
            let deck = library::create_deck(&store, "ann", "Essays").await.unwrap();
            let note = library::add_note(
                &store,
                "ann",
                deck.id,
                NewNote {
                    book_id: "montaigne".into(),
                    book_name: "Essays".into(),
                    book_detail: Some("I.20".into()),
                    content: "To philosophize is to learn to die".into(),
                },
            )
            .await
            .unwrap();
            library::review_note(&store, "ann", note.id, Quality::new(3).unwrap(), now)
                .await
                .unwrap();
            market::list_for_sale(&store, "ann", deck.id, 250, "").await.unwrap();
            (deck.id, note.id)
        };

        let store = open(dir.path()).await;
        assert_eq!(store.get_deck(deck_id).await.unwrap().name, "Essays");
        let note = store.get_note(note_id).await.unwrap();
        assert_eq!(note.review.review_count, 1);
        assert_eq!(note.review.last_reviewed, Some(now));
        assert_eq!(store.list_reviews_for_note(note_id).await.unwrap().len(), 1);
        assert_eq!(store.list_listings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backups_are_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        for i in 0..5 {
            store.create_deck("ann", &format!("deck {i}")).await.unwrap();
        }
        let count = fs::read_dir(dir.path().join("backups")).unwrap().count();
        assert!((1..=3).contains(&count));
    }

    #[tokio::test]
    async fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("store.json"), "{ not json").unwrap();
        let err = JsonStore::open_with(dir.path().join("store.json"), dir.path().join("backups"), 3)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Storage(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_all_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(open(dir.path()).await);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_deck("ann", &format!("deck {i}")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(store);

        let reopened = open(dir.path()).await;
        assert_eq!(reopened.list_decks(Some("ann")).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn deck_names_collide_across_unicode_case() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create_deck("ann", "Émile").await.unwrap();
        let err = store.create_deck("ann", "émile").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
