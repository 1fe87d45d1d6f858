use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::extract::ConnectInfo;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::response::Response;
use futures_util::FutureExt;
use tower::{Layer, Service};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::logging::{render_exception, render_named, with_request_id};

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Wraps a service with request-id assignment and start/completion/failure logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLoggingLayer;

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLogging<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLogging { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLogging<S> {
    inner: S,
}

impl<S, B> Service<Request<B>> for RequestLogging<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let request_id = request
            .headers()
            .get(&X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let method = request.method().clone();
        let path = request.uri().path().to_owned();
        let client_host = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        // The ready service is the one that must handle this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let scoped_id = request_id.clone();
        let handled = async move {
            info!(
                method = %method,
                path = %path,
                client_host = client_host.as_deref(),
                "request.started"
            );

            let start = Instant::now();
            let outcome = AssertUnwindSafe(inner.call(request)).catch_unwind().await;
            let duration_seconds = round_to_millis(start.elapsed());

            match outcome {
                Ok(Ok(mut response)) => {
                    info!(
                        method = %method,
                        path = %path,
                        status_code = response.status().as_u16(),
                        duration_seconds,
                        "request.completed"
                    );

                    match HeaderValue::from_str(&request_id) {
                        Ok(value) => {
                            response.headers_mut().insert(X_REQUEST_ID.clone(), value);
                        }
                        Err(_) => warn!("request.id_header_rejected"),
                    }
                    Ok(response)
                }
                Ok(Err(err)) => {
                    error!(
                        method = %method,
                        path = %path,
                        error = %err,
                        duration_seconds,
                        exception = %render_exception(&err),
                        "request.failed"
                    );
                    Err(err)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        method = %method,
                        path = %path,
                        error = %message,
                        duration_seconds,
                        exception = %render_named("panic", &message, None),
                        "request.failed"
                    );
                    std::panic::resume_unwind(panic)
                }
            }
        };

        Box::pin(with_request_id(scoped_id, handled))
    }
}

fn round_to_millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// CORS for the configured origins, with credentials and any method or header.
///
/// Methods and headers are mirrored from the preflight request because wildcards
/// cannot be combined with credentials.
pub fn create_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "cors.origin_rejected");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{current_request_id, test_support::CapturedLogs};
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;
    use tower_http::catch_panic::CatchPanicLayer;
    use tracing_subscriber::filter::LevelFilter;

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn test_app() -> Router {
        Router::new()
            .route("/test", get(|| async { "ok" }))
            .route(
                "/echo-id",
                get(|| async { current_request_id().unwrap_or_default() }),
            )
            .route(
                "/panic",
                get(|| async {
                    if true {
                        panic!("boom");
                    }
                    "unreachable"
                }),
            )
            .layer(RequestLoggingLayer)
            .layer(CatchPanicLayer::new())
    }

    #[tokio::test]
    async fn test_generates_request_id_when_missing() {
        let response = test_app().oneshot(request("/test")).await.unwrap();

        let header = response.headers().get(&X_REQUEST_ID).unwrap();
        let request_id = header.to_str().unwrap();
        assert!(!request_id.is_empty());
        assert!(Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn test_echoes_provided_request_id() {
        let request = Request::builder()
            .uri("/echo-id")
            .header("X-Request-ID", "test-request-123")
            .body(Body::empty())
            .unwrap();
        let response = test_app().oneshot(request).await.unwrap();

        assert_eq!(response.headers()[&X_REQUEST_ID], "test-request-123");

        // Handlers see the same id through the task-local slot.
        let bytes = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&bytes[..], b"test-request-123");
    }

    #[tokio::test]
    async fn test_logs_started_then_completed() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber(LevelFilter::INFO));

        let request = Request::builder()
            .method(Method::GET)
            .uri("/test")
            .header("X-Request-ID", "abc-1")
            .body(Body::empty())
            .unwrap();
        test_app().oneshot(request).await.unwrap();

        let records = logs.records();
        let names: Vec<&str> = records.iter().map(|r| r["event"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["request.started", "request.completed"]);

        assert_eq!(records[0]["method"], "GET");
        assert_eq!(records[0]["path"], "/test");
        assert_eq!(records[0]["request_id"], "abc-1");
        assert_eq!(records[1]["status_code"], 200);
        assert_eq!(records[1]["request_id"], "abc-1");
        assert!(records[1]["duration_seconds"].as_f64().unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_service_error_is_logged_and_propagated() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber(LevelFilter::INFO));

        let failing = tower::service_fn(|_request: Request<Body>| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err::<Response, _>(std::io::Error::new(std::io::ErrorKind::Other, "Test error"))
        });
        let service = RequestLoggingLayer.layer(failing);

        let err = service.oneshot(request("/api/error")).await.unwrap_err();
        assert_eq!(err.to_string(), "Test error");

        let failed = logs.events("request.failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["level"], "error");
        assert_eq!(failed[0]["path"], "/api/error");
        assert_eq!(failed[0]["error"], "Test error");
        assert!(failed[0]["duration_seconds"].as_f64().unwrap() > 0.0);
        assert!(failed[0]["exception"].as_str().unwrap().contains("Test error"));
        assert!(logs.events("request.completed").is_empty());
        assert_eq!(logs.events("request.started").len(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_logged_and_resumed() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber(LevelFilter::INFO));

        let response = test_app().oneshot(request("/panic")).await.unwrap();

        // The panic reaches the outer catch-panic layer, which owns the response.
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(&X_REQUEST_ID).is_none());

        let failed = logs.events("request.failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["error"], "boom");
    }

    #[tokio::test]
    async fn test_error_status_responses_still_complete() {
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber(LevelFilter::INFO));

        let app = Router::new()
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "nope").into_response() }),
            )
            .layer(RequestLoggingLayer);
        let response = app.oneshot(request("/missing")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(&X_REQUEST_ID));
        assert_eq!(logs.events("request.completed")[0]["status_code"], 404);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin_with_credentials() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(create_cors_layer(&["http://localhost:3000".to_string()]));

        let request = Request::builder()
            .uri("/")
            .header("Origin", "http://localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );
        assert_eq!(response.headers()["access-control-allow-credentials"], "true");

        let request = Request::builder()
            .uri("/")
            .header("Origin", "http://evil.test")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[test]
    fn test_round_to_millis() {
        assert_eq!(round_to_millis(Duration::from_micros(1_234_567)), 1.235);
        assert_eq!(round_to_millis(Duration::ZERO), 0.0);
    }
}
