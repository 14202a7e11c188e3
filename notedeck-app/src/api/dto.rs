use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use notedeck_core::{CoreError, Deck, DueStatus, Note, Quality};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize)]
pub struct DeckOut {
    pub id: Uuid,
    pub name: String,
    pub author: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl From<Deck> for DeckOut {
    fn from(d: Deck) -> Self {
        Self {
            id: d.id,
            name: d.name,
            author: d.author,
            description: d.description,
            created_at: d.created_at,
        }
    }
}

#[derive(Serialize)]
pub struct NoteOut {
    pub id: Uuid,
    pub deck_id: Uuid,
    pub book_name: String,
    pub book_detail: Option<String>,
    pub content: String,
    pub review_count: u32,
    pub last_reviewed: Option<DateTime<Utc>>,
    pub next_review_date: Option<DateTime<Utc>>,
    pub status: DueStatus,
}

impl NoteOut {
    pub fn at(n: Note, now: DateTime<Utc>) -> Self {
        let status = n.due_status(now);
        Self {
            id: n.id,
            deck_id: n.deck_id,
            book_name: n.book_name,
            book_detail: n.book_detail,
            content: n.content.latest,
            review_count: n.review.review_count,
            last_reviewed: n.review.last_reviewed,
            next_review_date: n.review.next_review_date,
            status,
        }
    }
}

/// `quality` is taken as any JSON value so that fractions, strings and
/// out-of-range numbers all fail domain validation with a labelled 422.
#[derive(Deserialize)]
pub struct ReviewIn {
    pub note_id: Uuid,
    pub quality: serde_json::Value,
}

impl ReviewIn {
    pub fn quality(&self) -> Result<Quality, CoreError> {
        match &self.quality {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) => Quality::new(v),
                None => Quality::from_f64(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => s.parse(),
            other => Err(CoreError::InvalidQuality(other.to_string())),
        }
    }
}

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &CoreError) -> StatusCode {
    match e {
        CoreError::InvalidQuality(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
