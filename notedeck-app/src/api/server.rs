use axum::{
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::routes::{due_notes, get_store, list_decks, list_store, post_review, AppState};
use notedeck_core::Repository;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/decks", get(list_decks))
        .route("/due", get(due_notes))
        .route("/review", post(post_review))
        .route("/store", get(list_store))
        .route("/store/:id", get(get_store))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(repo: Arc<dyn Repository>, user: String, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(Arc::new(AppState { repo, user }));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "api listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
