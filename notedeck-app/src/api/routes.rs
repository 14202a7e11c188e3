use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use notedeck_core::{
    due_queue, library, CoreError, QueueOptions, Repository, ScheduledReview, StoreDeck,
};

use crate::api::dto::{ApiError, DeckOut, NoteOut, ReviewIn};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub user: String,
}

#[derive(Deserialize)]
pub struct DueQuery {
    deck: Option<Uuid>,
    include_new: Option<bool>,
    include_lapsed: Option<bool>,
    max: Option<usize>,
}

pub async fn list_decks(State(st): State<Arc<AppState>>) -> Result<Json<Vec<DeckOut>>, ApiError> {
    let decks = st.repo.list_decks(Some(st.user.as_str())).await?;
    Ok(Json(decks.into_iter().map(DeckOut::from).collect()))
}

pub async fn due_notes(
    State(st): State<Arc<AppState>>,
    Query(q): Query<DueQuery>,
) -> Result<Json<Vec<NoteOut>>, ApiError> {
    let now = Utc::now();
    let deck_ids = match q.deck {
        Some(id) => vec![library::owned_deck(&*st.repo, &st.user, id).await?.id],
        None => st
            .repo
            .list_decks(Some(st.user.as_str()))
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect(),
    };

    let mut notes = Vec::new();
    for id in deck_ids {
        notes.extend(st.repo.list_notes(Some(id)).await?);
    }
    let opts = QueueOptions {
        include_new: q.include_new.unwrap_or(true),
        include_lapsed: q.include_lapsed.unwrap_or(true),
        max: q.max,
    };
    let queue = due_queue(&notes, now, &opts);
    Ok(Json(queue.into_iter().map(|n| NoteOut::at(n, now)).collect()))
}

pub async fn post_review(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ReviewIn>,
) -> Result<Json<ScheduledReview>, ApiError> {
    let quality = body.quality()?;
    let out = library::review_note(&*st.repo, &st.user, body.note_id, quality, Utc::now()).await?;
    Ok(Json(out))
}

pub async fn list_store(State(st): State<Arc<AppState>>) -> Result<Json<Vec<StoreDeck>>, ApiError> {
    Ok(Json(st.repo.list_listings().await?))
}

pub async fn get_store(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StoreDeck>, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| CoreError::Invalid("malformed listing id"))?;
    Ok(Json(st.repo.get_listing(id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::server::build_router;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use notedeck_core::{repo::memory::MemoryRepo, NewNote};
    use tower::ServiceExt;

    async fn seeded() -> (Arc<AppState>, Uuid) {
        let repo = Arc::new(MemoryRepo::new());
        let deck = library::create_deck(&*repo, "ana", "Stoics").await.unwrap();
        let note = library::add_note(
            &*repo,
            "ana",
            deck.id,
            NewNote {
                book_id: "meditations".into(),
                book_name: "Meditations".into(),
                book_detail: Some("Book II".into()),
                content: "Begin the morning by saying to thyself...".into(),
            },
        )
        .await
        .unwrap();
        let st = Arc::new(AppState { repo, user: "ana".into() });
        (st, note.id)
    }

    fn review_req(note_id: Uuid, quality: impl Into<serde_json::Value>) -> Request<Body> {
        let body = serde_json::json!({ "note_id": note_id, "quality": quality.into() });
        Request::post("/review")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn review_returns_schedule() {
        let (st, note_id) = seeded().await;
        let app = build_router(st.clone());

        let res = app.oneshot(review_req(note_id, 3)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let out: ScheduledReview = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(out.review_count, 1);
        assert_eq!((out.next_review_date - out.last_reviewed).num_days(), 8);

        let stored = st.repo.get_note(note_id).await.unwrap();
        assert_eq!(stored.review.review_count, 1);
    }

    #[tokio::test]
    async fn out_of_range_quality_is_unprocessable() {
        let (st, note_id) = seeded().await;
        let res = build_router(st.clone())
            .oneshot(review_req(note_id, 9))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let stored = st.repo.get_note(note_id).await.unwrap();
        assert!(stored.is_new());
    }

    #[tokio::test]
    async fn fractional_or_textual_quality_gets_labelled_error() {
        let (st, note_id) = seeded().await;
        for bad in [serde_json::json!(2.5), serde_json::json!("high"), serde_json::json!(null)] {
            let res = build_router(st.clone())
                .oneshot(review_req(note_id, bad))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
            let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
            let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert!(v["error"].as_str().unwrap().starts_with("invalid quality"));
        }
        assert!(st.repo.get_note(note_id).await.unwrap().is_new());

        let res = build_router(st.clone())
            .oneshot(review_req(note_id, "4"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn other_users_cannot_review() {
        let (st, note_id) = seeded().await;
        let other = Arc::new(AppState { repo: st.repo.clone(), user: "bo".into() });
        let res = build_router(other).oneshot(review_req(note_id, 4)).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn new_notes_are_due() {
        let (st, note_id) = seeded().await;
        let res = build_router(st)
            .oneshot(Request::get("/due").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v[0]["id"], note_id.to_string());
        assert_eq!(v[0]["status"], "new");
    }

    #[tokio::test]
    async fn unknown_listing_is_not_found() {
        let (st, _) = seeded().await;
        let uri = format!("/store/{}", Uuid::new_v4());
        let res = build_router(st)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
