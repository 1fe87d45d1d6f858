use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::logging::render_named;

/// Domain errors raised by data-access code.
///
/// Every variant is a kind of database error; `kind()` names it and
/// `status_code()` picks the HTTP status it maps to.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{message}")]
    Query {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Details of a mapped [`DatabaseError`], carried on the response for [`log_database_errors`].
#[derive(Debug, Clone)]
pub struct DatabaseErrorReport {
    pub message: String,
    pub kind: &'static str,
    pub exception: String,
}

impl DatabaseError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            source: None,
        }
    }

    fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Query {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DatabaseError::NotFound(_) => "NotFoundError",
            DatabaseError::Validation(_) => "ValidationError",
            DatabaseError::Query { .. } => "DatabaseError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DatabaseError::NotFound(_) => StatusCode::NOT_FOUND,
            DatabaseError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DatabaseError::Query { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn report(&self) -> DatabaseErrorReport {
        DatabaseErrorReport {
            message: self.to_string(),
            kind: self.kind(),
            exception: render_named(self.kind(), self, std::error::Error::source(self)),
        }
    }
}

impl IntoResponse for DatabaseError {
    fn into_response(self) -> Response {
        let report = self.report();
        let body = Json(json!({
            "error": report.message,
            "type": report.kind,
        }));

        let mut response = (self.status_code(), body).into_response();
        response.extensions_mut().insert(report);
        response
    }
}

/// Logs every [`DatabaseError`] that a handler turned into a response.
pub async fn log_database_errors(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    let response = next.run(request).await;

    if let Some(report) = response.extensions().get::<DatabaseErrorReport>() {
        tracing::error!(
            error = %report.message,
            error_type = report.kind,
            path = %path,
            status_code = response.status().as_u16(),
            exception = %report.exception,
            "database.exception"
        );
    }

    response
}

/// An HTTP failure with a fixed, caller-facing detail message.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{detail}")]
pub struct HttpError {
    pub status: StatusCode,
    pub detail: &'static str,
}

impl HttpError {
    pub fn service_unavailable(detail: &'static str) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            detail,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

// PostgreSQL error mapping
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        DatabaseError::with_source("Database operation failed", err)
    }
}

// Connection pool error mapping
impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        let message = match err {
            deadpool_postgres::PoolError::Timeout(_) => "Database connection timeout",
            deadpool_postgres::PoolError::Closed => "Database connection pool is closed",
            _ => "Database connection unavailable",
        };
        DatabaseError::with_source(message, err)
    }
}
