use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Initialize tracing with stdout, optional rolling file, and Sentry layers.
///
/// - Stdout: compact human-readable output, or JSON lines when `json` is set
/// - File: daily-rolling `sentinel.log` under `dir`, always JSON
/// - Sentry: captures ERROR events as issues, WARN as breadcrumbs
/// - Default level: INFO, override via RUST_LOG env
///
/// Keep the returned guard alive for the lifetime of the process so buffered
/// file output is flushed on exit.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sentinel_worker=debug,sentinel_lib=debug"));

    let (stdout_compact, stdout_json) = if config.json {
        (None, Some(fmt::layer().json().with_current_span(false)))
    } else {
        (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            ),
            None,
        )
    };

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sentinel.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    // Routes tracing::error!/warn! calls to Sentry automatically.
    // No-op when Sentry DSN is not configured.
    let sentry_layer = sentry_tracing::layer().event_filter(|meta| match *meta.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_compact)
        .with(stdout_json)
        .with(file_layer)
        .with(sentry_layer)
        .init();

    tracing::debug!("Tracing initialized");
    guard
}
