//! Structured JSON logging with request-id correlation.
//!
//! Events are emitted through the ordinary `tracing` macros. The event name is the
//! message and follows the dotted `domain.component.action_state` convention:
//!
//! ```ignore
//! tracing::info!(method = "GET", path = "/health", "request.started");
//! ```
//!
//! Each event is rendered as one JSON object per line carrying `event`, `level`,
//! `logger`, `timestamp`, the event fields, and `request_id` when the emitting task
//! runs inside [`with_request_id`].

use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::OnceLock;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{DefaultFields, Writer};
use tracing_subscriber::fmt::{self as tracing_fmt, FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Dependency targets that are capped at WARN regardless of the configured level.
const NOISY_TARGETS: [&str; 2] = ["hyper", "tokio_postgres"];

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to install global subscriber: {0}")]
    Init(#[from] TryInitError),

    #[error("failed to reload log filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Installs the process-wide JSON subscriber writing to stdout.
///
/// The first call installs the subscriber. Later calls only replace the level
/// filter, so the most recent level wins.
pub fn setup_logging(log_level: &str) -> Result<(), LoggingError> {
    let filter = build_filter(log_level);

    if let Some(handle) = FILTER_HANDLE.get() {
        handle.reload(filter)?;
        tracing::debug!(log_level = %log_level, "logging.level_reloaded");
        return Ok(());
    }

    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer(std::io::stdout))
        .try_init()?;

    // A concurrent first caller losing this race keeps the winner's handle.
    let _ = FILTER_HANDLE.set(handle);
    tracing::debug!(log_level = %log_level, "logging.setup_completed");
    Ok(())
}

/// Maps a configured level name onto a tracing filter. Unknown names fall back to INFO.
///
/// Nothing is emitted above ERROR, so `CRITICAL` and `FATAL` silence all records.
pub fn parse_level(log_level: &str) -> LevelFilter {
    match log_level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => LevelFilter::TRACE,
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "ERROR" => LevelFilter::ERROR,
        "CRITICAL" | "FATAL" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

fn build_filter(log_level: &str) -> EnvFilter {
    let level = parse_level(log_level);
    let noisy_cap = std::cmp::min(level, LevelFilter::WARN);

    let mut directives = level.to_string();
    for target in NOISY_TARGETS {
        directives.push_str(&format!(",{target}={noisy_cap}"));
    }

    EnvFilter::new(directives)
}

/// The formatting layer used by [`setup_logging`], generic over the output sink.
pub fn json_layer<S, W>(make_writer: W) -> tracing_fmt::Layer<S, DefaultFields, JsonFormat, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    tracing_fmt::layer()
        .event_format(JsonFormat)
        .with_writer(make_writer)
}

/// Runs `future` with `request_id` as the task's current request id.
///
/// The id is visible only to code polled inside the returned future, so
/// concurrently handled requests never observe each other's id.
pub fn with_request_id<F>(request_id: String, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future)
}

/// Synchronous counterpart of [`with_request_id`].
#[cfg(test)]
pub(crate) fn sync_scope<R>(request_id: String, f: impl FnOnce() -> R) -> R {
    REQUEST_ID.sync_scope(request_id, f)
}

/// The current request id, if one is set and non-empty.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID
        .try_with(|id| id.clone())
        .ok()
        .filter(|id| !id.is_empty())
}

/// Renders a failure as `<Type>: <message>` plus a backtrace when capture is enabled.
pub fn render_exception<E: fmt::Display>(err: &E) -> String {
    render_named(short_type_name::<E>(), err, None)
}

/// Like [`render_exception`], with one `Caused by:` line per source error.
pub fn render_error<E: StdError>(err: &E) -> String {
    render_named(short_type_name::<E>(), err, err.source())
}

pub(crate) fn render_named(
    type_name: &str,
    message: &dyn fmt::Display,
    mut source: Option<&(dyn StdError + 'static)>,
) -> String {
    let mut rendered = format!("{type_name}: {message}");

    while let Some(cause) = source {
        rendered.push_str(&format!("\nCaused by: {cause}"));
        source = cause.source();
    }

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        rendered.push_str(&format!("\nStack backtrace:\n{backtrace}"));
    }

    rendered
}

fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warning",
        Level::ERROR => "error",
    }
}

/// One JSON object per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl<S, N> FormatEvent<S, N> for JsonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut record = Map::new();
        record.insert("event".into(), Value::String(fields.message.unwrap_or_default()));
        record.insert("level".into(), level_name(metadata.level()).into());
        record.insert("logger".into(), metadata.target().into());
        record.insert(
            "timestamp".into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true).into(),
        );
        if let Some(request_id) = current_request_id() {
            record.insert("request_id".into(), request_id.into());
        }

        // Reserved keys above are never overwritten by event fields.
        for (name, value) in fields.values {
            record.entry(name).or_insert(value);
        }

        let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: Vec<(String, Value)>,
}

impl FieldCollector {
    fn push(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.values.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldCollector {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn StdError + 'static)) {
        self.push(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, Value::String(format!("{value:?}")));
    }
}
