use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    max_files: usize,
    max_size_mb: u64,
    max_pages: u32,
    accepted_mime: [&'static str; 1],
}

/// Client-facing upload limits.
pub async fn config_handler(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = &state.deps.config;
    Json(ConfigResponse {
        max_files: config.max_files,
        max_size_mb: config.max_size_mb,
        max_pages: config.max_pages,
        accepted_mime: ["application/pdf"],
    })
}
