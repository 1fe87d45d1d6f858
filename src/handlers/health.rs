// Health handlers
// Liveness, database and readiness checks

use axum::{extract::State, Json};
use serde::Serialize;
use tracing::{debug, error};

use crate::{
    app::AppState,
    db::DatabaseProbe,
    error::HttpError,
    logging::render_error,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub environment: String,
    pub database: &'static str,
}

/// Liveness check
/// GET /health
/// No dependencies, always 200
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "api",
        provider: None,
    })
}

/// Database connectivity check
/// GET /health/db
/// 503 with a fixed message when the ping fails; the cause is only logged.
pub async fn database_health_check<D: DatabaseProbe>(
    State(state): State<AppState<D>>,
) -> Result<Json<HealthResponse>, HttpError> {
    match state.database.ping().await {
        Ok(()) => {
            debug!("database.health_check.success");
            Ok(Json(HealthResponse {
                status: "healthy",
                service: "database",
                provider: Some("postgresql"),
            }))
        }
        Err(e) => {
            error!(
                error = %e,
                exception = %render_error(&e),
                "database.health_check_failed"
            );
            Err(HttpError::service_unavailable("Database connection failed"))
        }
    }
}

/// Readiness check
/// GET /health/ready
pub async fn readiness_check<D: DatabaseProbe>(
    State(state): State<AppState<D>>,
) -> Result<Json<ReadinessResponse>, HttpError> {
    let environment = &state.settings.environment;

    match state.database.ping().await {
        Ok(()) => {
            debug!(environment = %environment, "readiness_check.success");
            Ok(Json(ReadinessResponse {
                status: "ready",
                environment: environment.clone(),
                database: "connected",
            }))
        }
        Err(e) => {
            error!(
                error = %e,
                environment = %environment,
                exception = %render_error(&e),
                "readiness_check.failed"
            );
            Err(HttpError::service_unavailable("Application not ready"))
        }
    }
}
