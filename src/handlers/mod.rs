// Handlers module
// HTTP handlers for the service surface

pub mod health;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::{app::AppState, db::DatabaseProbe};

/// Application identity returned by the root endpoint
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
    pub docs: &'static str,
}

/// Root handler
/// GET /
pub async fn root<D: DatabaseProbe>(State(state): State<AppState<D>>) -> Json<RootResponse> {
    Json(RootResponse {
        message: state.settings.app_name.clone(),
        version: state.settings.version.clone(),
        docs: "/docs",
    })
}
