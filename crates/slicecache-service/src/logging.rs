use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Crates whose events are shown at the configured level, everything else is capped at `warn`.
const ENGINE_TARGETS: &[&str] = &["slicecache_service", "slicecache_stress"];

/// The filter directive used when `RUST_LOG` is not set.
pub fn default_filter(level: LevelFilter) -> String {
    let mut directive = LevelFilter::WARN.min(level).to_string().to_lowercase();
    for target in ENGINE_TARGETS {
        directive.push_str(&format!(",{target}={}", level.to_string().to_lowercase()));
    }
    directive
}

/// Installs a global subscriber that writes one JSON object per event.
///
/// Events are also forwarded to sentry as breadcrumbs, errors become sentry events.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}
