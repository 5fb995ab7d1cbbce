//! Tracing setup for the service.
//!
//! - LOG_LEVEL is an `EnvFilter` directive string; unset or invalid falls back
//!   to `DEFAULT_FILTER`.
//! - LOG_FORMAT: "json" for structured lines, "compact" for one-liners,
//!   anything else for the default human format.
//!
//! Pipeline events log under the `pipeline` target, startup and HTTP handler
//! events under `studyquest`. TraceLayer adds the per-request spans.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,studyquest=debug,pipeline=debug,tower_http=info,axum=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Full,
    Compact,
    Json,
}

fn log_format(raw: Option<&str>) -> LogFormat {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        _ => LogFormat::Full,
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let format = log_format(std::env::var("LOG_FORMAT").ok().as_deref());
    match format {
        LogFormat::Json => builder.json().with_current_span(true).init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Full => builder.init(),
    }
}
