use chrono::{DateTime, SecondsFormat, Utc};
use notedeck_core::{
    repo::Repository, CoreError, Deck, DeckId, ListingId, Note, NoteContent, NoteId, Purchase,
    Quality, Rating, Review, ReviewState, ScheduledReview, StoreDeck,
};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::path::Path;
use tracing::debug;

pub struct SqliteRepo {
    pool: SqlitePool,
}

const NOTE_COLS: &str = "id,deck_id,book_id,book_name,book_detail,content_latest,content_history,
                         review_count,last_reviewed,next_review_date,created_at";
const LISTING_COLS: &str = "id,deck_id,deck_name,author,description,price_cents,purchase_count,
                            rating_sum,rating_count,note_count,preview_notes,referenced_books,listed_at";

impl SqliteRepo {
    pub async fn open_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|_| CoreError::Storage("sqlite connect"))?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        debug!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(repo)
    }

    /// Each in-memory connection is its own database, so the pool holds one.
    pub async fn open_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|_| CoreError::Storage("sqlite connect"))?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    async fn ensure_schema(&self) -> Result<(), CoreError> {
        const STMT: &str = r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS decks (
          id           TEXT PRIMARY KEY,
          name         TEXT NOT NULL,
          author       TEXT NOT NULL,
          description  TEXT NOT NULL DEFAULT '',
          created_at   TEXT NOT NULL,
          UNIQUE (author, name COLLATE NOCASE)
        );

        CREATE TABLE IF NOT EXISTS notes (
          id                TEXT PRIMARY KEY,
          deck_id           TEXT NOT NULL,
          book_id           TEXT NOT NULL,
          book_name         TEXT NOT NULL,
          book_detail       TEXT,
          content_latest    TEXT NOT NULL,
          content_history   TEXT NOT NULL DEFAULT '[]',
          review_count      INTEGER NOT NULL DEFAULT 0,
          last_reviewed     TEXT,
          next_review_date  TEXT,
          created_at        TEXT NOT NULL,
          FOREIGN KEY(deck_id) REFERENCES decks(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS reviews (
          id             TEXT PRIMARY KEY,
          note_id        TEXT NOT NULL,
          quality        INTEGER NOT NULL,
          reviewed_at    TEXT NOT NULL,
          interval_days  INTEGER NOT NULL,
          FOREIGN KEY(note_id) REFERENCES notes(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS listings (
          id                TEXT PRIMARY KEY,
          deck_id           TEXT NOT NULL,
          deck_name         TEXT NOT NULL,
          author            TEXT NOT NULL,
          description       TEXT NOT NULL,
          price_cents       INTEGER NOT NULL,
          purchase_count    INTEGER NOT NULL DEFAULT 0,
          rating_sum        INTEGER NOT NULL DEFAULT 0,
          rating_count      INTEGER NOT NULL DEFAULT 0,
          note_count        INTEGER NOT NULL,
          preview_notes     TEXT NOT NULL,
          referenced_books  TEXT NOT NULL,
          listed_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ratings (
          id          TEXT PRIMARY KEY,
          listing_id  TEXT NOT NULL,
          user_id     TEXT NOT NULL,
          rating      INTEGER NOT NULL,
          review      TEXT,
          created_at  TEXT NOT NULL,
          FOREIGN KEY(listing_id) REFERENCES listings(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS purchases (
          user_id       TEXT NOT NULL,
          listing_id    TEXT NOT NULL,
          purchased_at  TEXT NOT NULL,
          PRIMARY KEY (user_id, listing_id)
        );

        CREATE INDEX IF NOT EXISTS idx_notes_deck_due ON notes (deck_id, next_review_date);
        CREATE INDEX IF NOT EXISTS idx_reviews_note_time ON reviews (note_id, reviewed_at)
        "#;

        for chunk in STMT.split(';') {
            let sql = chunk.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|_| CoreError::Storage("sqlite schema"))?;
        }
        Ok(())
    }

    /// SQLite's `lower()` and `NOCASE` only fold ASCII, so names are
    /// compared here.
    async fn deck_name_taken(
        &self,
        author: &str,
        name: &str,
        except: Option<DeckId>,
    ) -> Result<bool, CoreError> {
        let decks = self.list_decks(Some(author)).await?;
        Ok(decks
            .iter()
            .any(|d| Some(d.id) != except && d.has_name(name)))
    }
}

async fn insert_review_row(
    conn: &mut sqlx::SqliteConnection,
    review: &Review,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"INSERT INTO reviews (id,note_id,quality,reviewed_at,interval_days)
           VALUES (?,?,?,?,?)"#,
    )
    .bind(review.id.to_string())
    .bind(review.note_id.to_string())
    .bind(review.quality.value() as i64)
    .bind(dt_to_str(review.reviewed_at))
    .bind(review.interval_days as i64)
    .execute(conn)
    .await
    .map_err(|_| CoreError::Storage("insert review"))?;
    Ok(())
}

#[async_trait::async_trait]
impl Repository for SqliteRepo {
    // ===== Decks =====
    async fn create_deck(&self, author: &str, name: &str) -> Result<Deck, CoreError> {
        if self.deck_name_taken(author, name, None).await? {
            return Err(CoreError::Conflict("deck name already exists"));
        }
        let deck = Deck::new(author, name);
        sqlx::query("INSERT INTO decks (id,name,author,description,created_at) VALUES (?,?,?,?,?)")
            .bind(deck.id.to_string())
            .bind(&deck.name)
            .bind(&deck.author)
            .bind(&deck.description)
            .bind(dt_to_str(deck.created_at))
            .execute(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("insert deck"))?;
        Ok(deck)
    }

    async fn get_deck(&self, id: DeckId) -> Result<Deck, CoreError> {
        let row = sqlx::query("SELECT id,name,author,description,created_at FROM decks WHERE id=?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("read deck"))?;
        row_into_deck(row.ok_or(CoreError::NotFound("deck"))?)
    }

    async fn list_decks(&self, author: Option<&str>) -> Result<Vec<Deck>, CoreError> {
        let res = if let Some(a) = author {
            sqlx::query(
                "SELECT id,name,author,description,created_at FROM decks
                 WHERE author=? ORDER BY created_at ASC",
            )
            .bind(a)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT id,name,author,description,created_at FROM decks ORDER BY created_at ASC",
            )
            .fetch_all(&self.pool)
            .await
        };
        let rows = res.map_err(|_| CoreError::Storage("list decks"))?;
        rows.into_iter().map(row_into_deck).collect()
    }

    async fn update_deck(&self, deck: &Deck) -> Result<Deck, CoreError> {
        if self
            .deck_name_taken(&deck.author, &deck.name, Some(deck.id))
            .await?
        {
            return Err(CoreError::Conflict("deck name already exists"));
        }
        let res = sqlx::query("UPDATE decks SET name=?, author=?, description=? WHERE id=?")
            .bind(&deck.name)
            .bind(&deck.author)
            .bind(&deck.description)
            .bind(deck.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("update deck"))?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound("deck"));
        }
        Ok(deck.clone())
    }

    async fn delete_deck(&self, id: DeckId) -> Result<(), CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| CoreError::Storage("tx"))?;

        sqlx::query("DELETE FROM reviews WHERE note_id IN (SELECT id FROM notes WHERE deck_id=?)")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del reviews"))?;

        sqlx::query("DELETE FROM notes WHERE deck_id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del notes"))?;

        let res = sqlx::query("DELETE FROM decks WHERE id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del deck"))?;
        if res.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(CoreError::NotFound("deck"));
        }

        tx.commit()
            .await
            .map_err(|_| CoreError::Storage("tx commit"))
    }

    // ===== Notes =====
    async fn insert_note(&self, note: &Note) -> Result<(), CoreError> {
        let exists = sqlx::query("SELECT 1 FROM decks WHERE id=? LIMIT 1")
            .bind(note.deck_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("read deck"))?
            .is_some();
        if !exists {
            return Err(CoreError::NotFound("deck"));
        }

        sqlx::query(&format!(
            "INSERT INTO notes ({NOTE_COLS}) VALUES (?,?,?,?,?,?,?,?,?,?,?)"
        ))
        .bind(note.id.to_string())
        .bind(note.deck_id.to_string())
        .bind(&note.book_id)
        .bind(&note.book_name)
        .bind(note.book_detail.clone())
        .bind(&note.content.latest)
        .bind(to_json(&note.content.history)?)
        .bind(note.review.review_count as i64)
        .bind(note.review.last_reviewed.map(dt_to_str))
        .bind(note.review.next_review_date.map(dt_to_str))
        .bind(dt_to_str(note.created_at))
        .execute(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("insert note"))?;
        Ok(())
    }

    async fn get_note(&self, id: NoteId) -> Result<Note, CoreError> {
        let row = sqlx::query(&format!("SELECT {NOTE_COLS} FROM notes WHERE id=?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("read note"))?;
        row_into_note(row.ok_or(CoreError::NotFound("note"))?)
    }

    async fn list_notes(&self, deck_id: Option<DeckId>) -> Result<Vec<Note>, CoreError> {
        let res = if let Some(did) = deck_id {
            sqlx::query(&format!(
                "SELECT {NOTE_COLS} FROM notes WHERE deck_id=? ORDER BY created_at ASC"
            ))
            .bind(did.to_string())
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(&format!(
                "SELECT {NOTE_COLS} FROM notes ORDER BY created_at ASC"
            ))
            .fetch_all(&self.pool)
            .await
        };
        let rows = res.map_err(|_| CoreError::Storage("list notes"))?;
        rows.into_iter().map(row_into_note).collect()
    }

    async fn update_note(&self, note: &Note) -> Result<Note, CoreError> {
        let res = sqlx::query(
            r#"
            UPDATE notes SET
              deck_id=?, book_id=?, book_name=?, book_detail=?, content_latest=?,
              content_history=?, review_count=?, last_reviewed=?, next_review_date=?
            WHERE id=?
            "#,
        )
        .bind(note.deck_id.to_string())
        .bind(&note.book_id)
        .bind(&note.book_name)
        .bind(note.book_detail.clone())
        .bind(&note.content.latest)
        .bind(to_json(&note.content.history)?)
        .bind(note.review.review_count as i64)
        .bind(note.review.last_reviewed.map(dt_to_str))
        .bind(note.review.next_review_date.map(dt_to_str))
        .bind(note.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("update note"))?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound("note"));
        }
        Ok(note.clone())
    }

    async fn delete_note(&self, id: NoteId) -> Result<(), CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| CoreError::Storage("tx"))?;
        sqlx::query("DELETE FROM reviews WHERE note_id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del reviews"))?;
        let res = sqlx::query("DELETE FROM notes WHERE id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del note"))?;
        if res.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(CoreError::NotFound("note"));
        }
        tx.commit()
            .await
            .map_err(|_| CoreError::Storage("tx commit"))
    }

    async fn apply_review(
        &self,
        note_id: NoteId,
        expected_review_count: u32,
        scheduled: &ScheduledReview,
        review: &Review,
    ) -> Result<Note, CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| CoreError::Storage("tx"))?;
        let res = sqlx::query(
            "UPDATE notes SET review_count=?, last_reviewed=?, next_review_date=?
             WHERE id=? AND review_count=?",
        )
        .bind(scheduled.review_count as i64)
        .bind(dt_to_str(scheduled.last_reviewed))
        .bind(dt_to_str(scheduled.next_review_date))
        .bind(note_id.to_string())
        .bind(expected_review_count as i64)
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("apply review"))?;
        if res.rows_affected() == 0 {
            tx.rollback().await.ok();
            // Either the note is gone or someone else got there first.
            self.get_note(note_id).await?;
            return Err(CoreError::Conflict("note was reviewed concurrently"));
        }
        insert_review_row(&mut *tx, review).await?;
        tx.commit()
            .await
            .map_err(|_| CoreError::Storage("tx commit"))?;
        self.get_note(note_id).await
    }

    // ===== Reviews =====
    async fn insert_review(&self, review: &Review) -> Result<(), CoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|_| CoreError::Storage("sqlite connect"))?;
        insert_review_row(&mut *conn, review).await
    }

    async fn list_reviews_for_note(&self, note_id: NoteId) -> Result<Vec<Review>, CoreError> {
        let rows = sqlx::query(
            r#"SELECT id,note_id,quality,reviewed_at,interval_days
               FROM reviews WHERE note_id=? ORDER BY reviewed_at ASC"#,
        )
        .bind(note_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("list reviews"))?;
        rows.into_iter().map(row_into_review).collect()
    }

    async fn list_reviews(&self) -> Result<Vec<Review>, CoreError> {
        let rows = sqlx::query(
            "SELECT id,note_id,quality,reviewed_at,interval_days FROM reviews ORDER BY reviewed_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("list reviews"))?;
        rows.into_iter().map(row_into_review).collect()
    }

    // ===== Marketplace =====
    async fn insert_listing(&self, l: &StoreDeck) -> Result<(), CoreError> {
        sqlx::query(&format!(
            "INSERT INTO listings ({LISTING_COLS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)"
        ))
        .bind(l.id.to_string())
        .bind(l.deck_id.to_string())
        .bind(&l.deck_name)
        .bind(&l.author)
        .bind(&l.description)
        .bind(l.price_cents as i64)
        .bind(l.purchase_count as i64)
        .bind(l.rating_sum as i64)
        .bind(l.rating_count as i64)
        .bind(l.note_count as i64)
        .bind(to_json(&l.preview_notes)?)
        .bind(to_json(&l.referenced_books)?)
        .bind(dt_to_str(l.listed_at))
        .execute(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("insert listing"))?;
        Ok(())
    }

    async fn get_listing(&self, id: ListingId) -> Result<StoreDeck, CoreError> {
        let row = sqlx::query(&format!("SELECT {LISTING_COLS} FROM listings WHERE id=?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| CoreError::Storage("read listing"))?;
        row_into_listing(row.ok_or(CoreError::NotFound("listing"))?)
    }

    async fn list_listings(&self) -> Result<Vec<StoreDeck>, CoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLS} FROM listings ORDER BY listed_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("list listings"))?;
        rows.into_iter().map(row_into_listing).collect()
    }

    async fn update_listing(&self, l: &StoreDeck) -> Result<StoreDeck, CoreError> {
        let res = sqlx::query(
            r#"
            UPDATE listings SET
              deck_name=?, description=?, price_cents=?, purchase_count=?, rating_sum=?,
              rating_count=?, note_count=?, preview_notes=?, referenced_books=?
            WHERE id=?
            "#,
        )
        .bind(&l.deck_name)
        .bind(&l.description)
        .bind(l.price_cents as i64)
        .bind(l.purchase_count as i64)
        .bind(l.rating_sum as i64)
        .bind(l.rating_count as i64)
        .bind(l.note_count as i64)
        .bind(to_json(&l.preview_notes)?)
        .bind(to_json(&l.referenced_books)?)
        .bind(l.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("update listing"))?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound("listing"));
        }
        Ok(l.clone())
    }

    async fn delete_listing(&self, id: ListingId) -> Result<(), CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| CoreError::Storage("tx"))?;
        sqlx::query("DELETE FROM ratings WHERE listing_id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del ratings"))?;
        let res = sqlx::query("DELETE FROM listings WHERE id=?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("del listing"))?;
        if res.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(CoreError::NotFound("listing"));
        }
        tx.commit()
            .await
            .map_err(|_| CoreError::Storage("tx commit"))
    }

    async fn insert_rating(&self, r: &Rating) -> Result<(), CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| CoreError::Storage("tx"))?;
        let res = sqlx::query(
            "UPDATE listings SET rating_sum=rating_sum+?, rating_count=rating_count+1 WHERE id=?",
        )
        .bind(r.rating as i64)
        .bind(r.listing_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("update listing"))?;
        if res.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(CoreError::NotFound("listing"));
        }
        let already = sqlx::query("SELECT 1 FROM ratings WHERE listing_id=? AND user_id=? LIMIT 1")
            .bind(r.listing_id.to_string())
            .bind(&r.user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read rating"))?;
        if already.is_some() {
            tx.rollback().await.ok();
            return Err(CoreError::Conflict("listing already rated by this user"));
        }
        sqlx::query(
            "INSERT INTO ratings (id,listing_id,user_id,rating,review,created_at) VALUES (?,?,?,?,?,?)",
        )
        .bind(r.id.to_string())
        .bind(r.listing_id.to_string())
        .bind(&r.user_id)
        .bind(r.rating as i64)
        .bind(r.review.clone())
        .bind(dt_to_str(r.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|_| CoreError::Storage("insert rating"))?;
        tx.commit()
            .await
            .map_err(|_| CoreError::Storage("tx commit"))
    }

    async fn list_ratings(&self, listing_id: ListingId) -> Result<Vec<Rating>, CoreError> {
        let rows = sqlx::query(
            "SELECT id,listing_id,user_id,rating,review,created_at FROM ratings
             WHERE listing_id=? ORDER BY created_at ASC",
        )
        .bind(listing_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("list ratings"))?;
        let mut v = Vec::with_capacity(rows.len());
        for row in rows {
            v.push(Rating {
                id: uuid_from_str(row.get::<String, _>("id"))?,
                listing_id: uuid_from_str(row.get::<String, _>("listing_id"))?,
                user_id: row.get::<String, _>("user_id"),
                rating: row.get::<i64, _>("rating") as u8,
                review: row.get::<Option<String>, _>("review"),
                created_at: dt_from_str(row.get::<String, _>("created_at"))?,
            });
        }
        Ok(v)
    }

    async fn insert_purchase(&self, p: &Purchase) -> Result<(), CoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| CoreError::Storage("tx"))?;
        let dup = sqlx::query("SELECT 1 FROM purchases WHERE user_id=? AND listing_id=? LIMIT 1")
            .bind(&p.user_id)
            .bind(p.listing_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("read purchase"))?;
        if dup.is_some() {
            tx.rollback().await.ok();
            return Err(CoreError::Conflict("already purchased"));
        }
        let res = sqlx::query("UPDATE listings SET purchase_count=purchase_count+1 WHERE id=?")
            .bind(p.listing_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("update listing"))?;
        if res.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(CoreError::NotFound("listing"));
        }
        sqlx::query("INSERT INTO purchases (user_id,listing_id,purchased_at) VALUES (?,?,?)")
            .bind(&p.user_id)
            .bind(p.listing_id.to_string())
            .bind(dt_to_str(p.purchased_at))
            .execute(&mut *tx)
            .await
            .map_err(|_| CoreError::Storage("insert purchase"))?;
        tx.commit()
            .await
            .map_err(|_| CoreError::Storage("tx commit"))
    }

    async fn list_purchases(&self, user: &str) -> Result<Vec<Purchase>, CoreError> {
        let rows = sqlx::query(
            "SELECT user_id,listing_id,purchased_at FROM purchases
             WHERE user_id=? ORDER BY purchased_at ASC",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(|_| CoreError::Storage("list purchases"))?;
        let mut v = Vec::with_capacity(rows.len());
        for row in rows {
            v.push(Purchase {
                user_id: row.get::<String, _>("user_id"),
                listing_id: uuid_from_str(row.get::<String, _>("listing_id"))?,
                purchased_at: dt_from_str(row.get::<String, _>("purchased_at"))?,
            });
        }
        Ok(v)
    }
}

// ===== Helpers =====
fn uuid_from_str(s: String) -> Result<uuid::Uuid, CoreError> {
    uuid::Uuid::parse_str(&s).map_err(|_| CoreError::Invalid("uuid"))
}

// Fixed-width so text ordering matches time ordering.
fn dt_to_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn dt_from_str(s: String) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(&s)
        .map_err(|_| CoreError::Invalid("datetime"))
        .map(|dt| dt.with_timezone(&Utc))
}

fn to_json<T: Serialize>(v: &T) -> Result<String, CoreError> {
    serde_json::to_string(v).map_err(|_| CoreError::Storage("encode json column"))
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T, CoreError> {
    serde_json::from_str(s).map_err(|_| CoreError::Storage("decode json column"))
}

fn row_into_deck(row: SqliteRow) -> Result<Deck, CoreError> {
    Ok(Deck {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        name: row.get::<String, _>("name"),
        author: row.get::<String, _>("author"),
        description: row.get::<String, _>("description"),
        created_at: dt_from_str(row.get::<String, _>("created_at"))?,
    })
}

fn row_into_note(row: SqliteRow) -> Result<Note, CoreError> {
    let history: Vec<String> = from_json(&row.get::<String, _>("content_history"))?;
    Ok(Note {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        deck_id: uuid_from_str(row.get::<String, _>("deck_id"))?,
        book_id: row.get::<String, _>("book_id"),
        book_name: row.get::<String, _>("book_name"),
        book_detail: row.get::<Option<String>, _>("book_detail"),
        content: NoteContent {
            latest: row.get::<String, _>("content_latest"),
            history,
        },
        review: ReviewState {
            review_count: row.get::<i64, _>("review_count") as u32,
            last_reviewed: row
                .get::<Option<String>, _>("last_reviewed")
                .map(dt_from_str)
                .transpose()?,
            next_review_date: row
                .get::<Option<String>, _>("next_review_date")
                .map(dt_from_str)
                .transpose()?,
        },
        created_at: dt_from_str(row.get::<String, _>("created_at"))?,
    })
}

fn row_into_review(row: SqliteRow) -> Result<Review, CoreError> {
    Ok(Review {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        note_id: uuid_from_str(row.get::<String, _>("note_id"))?,
        quality: Quality::new(row.get::<i64, _>("quality"))?,
        reviewed_at: dt_from_str(row.get::<String, _>("reviewed_at"))?,
        interval_days: row.get::<i64, _>("interval_days") as u32,
    })
}

fn row_into_listing(row: SqliteRow) -> Result<StoreDeck, CoreError> {
    Ok(StoreDeck {
        id: uuid_from_str(row.get::<String, _>("id"))?,
        deck_id: uuid_from_str(row.get::<String, _>("deck_id"))?,
        deck_name: row.get::<String, _>("deck_name"),
        author: row.get::<String, _>("author"),
        description: row.get::<String, _>("description"),
        price_cents: row.get::<i64, _>("price_cents") as u64,
        purchase_count: row.get::<i64, _>("purchase_count") as u32,
        rating_sum: row.get::<i64, _>("rating_sum") as u32,
        rating_count: row.get::<i64, _>("rating_count") as u32,
        note_count: row.get::<i64, _>("note_count") as u32,
        preview_notes: from_json(&row.get::<String, _>("preview_notes"))?,
        referenced_books: from_json(&row.get::<String, _>("referenced_books"))?,
        listed_at: dt_from_str(row.get::<String, _>("listed_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use notedeck_core::{library, market, NewNote};

    fn new_note(text: &str) -> NewNote {
        NewNote {
            book_id: "walden".into(),
            book_name: "Walden".into(),
            book_detail: None,
            content: text.into(),
        }
    }

    #[tokio::test]
    async fn review_round_trip() {
        let repo = SqliteRepo::open_memory().await.unwrap();
        let deck = library::create_deck(&repo, "ann", "Thoreau").await.unwrap();
        let note = library::add_note(&repo, "ann", deck.id, new_note("Simplify"))
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let out = library::review_note(&repo, "ann", note.id, Quality::new(4).unwrap(), now)
            .await
            .unwrap();
        assert_eq!(out.next_review_date, now + Duration::days(5));

        let stored = repo.get_note(note.id).await.unwrap();
        assert_eq!(stored.review.review_count, 1);
        assert_eq!(stored.review.last_reviewed, Some(now));
        assert_eq!(stored.review.next_review_date, Some(out.next_review_date));

        let log = repo.list_reviews().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].quality.value(), 4);
    }

    #[tokio::test]
    async fn stale_apply_conflicts() {
        let repo = SqliteRepo::open_memory().await.unwrap();
        let deck = repo.create_deck("ann", "D").await.unwrap();
        let note = library::add_note(&repo, "ann", deck.id, new_note("x")).await.unwrap();
        let q = Quality::new(2).unwrap();
        let s = notedeck_core::schedule(q, Utc::now(), 0);
        let log = |id| Review::new(id, q, s.last_reviewed, 11);

        repo.apply_review(note.id, 0, &s, &log(note.id)).await.unwrap();
        let err = repo
            .apply_review(note.id, 0, &s, &log(note.id))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(repo.list_reviews_for_note(note.id).await.unwrap().len(), 1);

        let missing_id = uuid::Uuid::new_v4();
        let missing = repo
            .apply_review(missing_id, 0, &s, &log(missing_id))
            .await
            .unwrap_err();
        assert!(matches!(missing, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_log_insert_rolls_back_schedule() {
        let repo = SqliteRepo::open_memory().await.unwrap();
        let deck = repo.create_deck("ann", "D").await.unwrap();
        let note = library::add_note(&repo, "ann", deck.id, new_note("x")).await.unwrap();
        let q = Quality::new(4).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = notedeck_core::schedule(q, t0, 0);
        let entry = Review::new(note.id, q, t0, 5);
        repo.apply_review(note.id, 0, &first, &entry).await.unwrap();

        // Reusing the log entry id violates the primary key.
        let second = notedeck_core::schedule(q, t0 + Duration::days(5), 1);
        let err = repo.apply_review(note.id, 1, &second, &entry).await.unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));

        let stored = repo.get_note(note.id).await.unwrap();
        assert_eq!(stored.review.review_count, 1);
        assert_eq!(stored.review.last_reviewed, Some(t0));
        assert_eq!(repo.list_reviews_for_note(note.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deck_names_collide_across_unicode_case() {
        let repo = SqliteRepo::open_memory().await.unwrap();
        repo.create_deck("ann", "Ärzte").await.unwrap();
        assert!(matches!(
            repo.create_deck("ann", "ärzte").await,
            Err(CoreError::Conflict(_))
        ));
        assert!(repo.create_deck("bob", "ärzte").await.is_ok());
    }

    #[tokio::test]
    async fn edit_history_and_deck_cascade() {
        let repo = SqliteRepo::open_memory().await.unwrap();
        let deck = repo.create_deck("ann", "D").await.unwrap();
        assert!(matches!(
            repo.create_deck("ann", "d").await,
            Err(CoreError::Conflict(_))
        ));
        let note = library::add_note(&repo, "ann", deck.id, new_note("one")).await.unwrap();
        library::edit_note(&repo, "ann", note.id, "two").await.unwrap();
        let stored = repo.get_note(note.id).await.unwrap();
        assert_eq!(stored.content.history, vec!["one".to_string()]);

        repo.delete_deck(deck.id).await.unwrap();
        assert!(repo.list_notes(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn marketplace_counters() {
        let repo = SqliteRepo::open_memory().await.unwrap();
        let deck = repo.create_deck("ann", "D").await.unwrap();
        library::add_note(&repo, "ann", deck.id, new_note("x")).await.unwrap();
        let listing = market::list_for_sale(&repo, "ann", deck.id, 999, "desc")
            .await
            .unwrap();

        market::purchase(&repo, "bob", listing.id).await.unwrap();
        assert!(matches!(
            market::purchase(&repo, "bob", listing.id).await,
            Err(CoreError::Conflict(_))
        ));
        market::rate(&repo, "bob", listing.id, 4, None).await.unwrap();
        assert!(matches!(
            market::rate(&repo, "bob", listing.id, 5, None).await,
            Err(CoreError::Conflict(_))
        ));

        let stored = repo.get_listing(listing.id).await.unwrap();
        assert_eq!(stored.purchase_count, 1);
        assert_eq!(stored.rating_count, 1);
        assert_eq!(stored.referenced_books.len(), 1);
        assert_eq!(repo.list_purchases("bob").await.unwrap().len(), 1);
    }
}
