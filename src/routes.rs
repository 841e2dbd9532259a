use axum::{
    Json, Router,
    extract::{Query, State},
    response::Response,
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::{
    catalog::FormatDescriptor,
    error::ApiError,
    service::{DownloadService, Egress},
};

#[derive(Clone)]
pub struct AppState {
    pub service: DownloadService,
}

#[derive(Debug, Deserialize)]
pub struct VideoQuery {
    url: Option<String>,
    format: Option<String>,
}

/// Download routes live at the root, under `/api`, and under `/proxied`
/// where every request first picks a rotating egress proxy.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(video_routes(Egress::Direct))
        .nest("/api", video_routes(Egress::Direct))
        .nest("/proxied", video_routes(Egress::Proxied))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn video_routes(egress: Egress) -> Router<AppState> {
    Router::new()
        .route(
            "/download",
            get(move |state: State<AppState>, query: Query<VideoQuery>| {
                download(state, query, egress)
            }),
        )
        .route(
            "/info",
            get(move |state: State<AppState>, query: Query<VideoQuery>| {
                info(state, query, egress)
            }),
        )
        .route(
            "/specificdownload",
            get(move |state: State<AppState>, query: Query<VideoQuery>| {
                specific_download(state, query, egress)
            }),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "time": Utc::now() }))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
    egress: Egress,
) -> Result<Response, ApiError> {
    Ok(state
        .service
        .download_best(query.url.as_deref(), egress)
        .await?)
}

async fn info(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
    egress: Egress,
) -> Result<Json<Vec<FormatDescriptor>>, ApiError> {
    let catalog = state
        .service
        .list_formats(query.url.as_deref(), egress)
        .await?;
    Ok(Json(catalog))
}

async fn specific_download(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
    egress: Egress,
) -> Result<Response, ApiError> {
    Ok(state
        .service
        .download_specific(query.url.as_deref(), query.format.as_deref(), egress)
        .await?)
}
