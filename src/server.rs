use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::handler::{
    handle_show, handle_status, handle_stream, handle_stream_head, handle_upload, handle_url,
    AppState,
};

/// Build the axum router for the public gateway and the ingestion API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/show/:token", get(handle_show))
        .route(
            "/dl/:object_id/:file_name",
            get(handle_stream).head(handle_stream_head),
        )
        .route(
            "/api/upload",
            post(handle_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/url", post(handle_url))
        .route("/status", get(handle_status))
        .with_state(state)
}
