use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "FLEETDECK_DEBUG_LOG";
const LOG_FILE: &str = "replay.log";

/// Logs go to stderr, so stdout carries only the report. With `log_dir`
/// they go to `<log_dir>/replay.log` instead; keep the guard alive until exit.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let registry = tracing_subscriber::registry().with(filter());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
