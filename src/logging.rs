//! Logging initialisation for macvm.
//!
//! Stderr output is always on, filtered by `RUST_LOG` (default `warn`). With
//! `MACVM_LOG=1` a second layer writes `macvm.log` into the OS log directory
//! at `info`, with the HTTP stack held at `warn` so multi-gigabyte image
//! downloads do not flood the file.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "macvm.log";
const FILE_FILTER: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main` and keep the returned `LogGuard` alive.
pub fn init(log_dir: &Path) -> LogGuard {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if std::env::var("MACVM_LOG").as_deref() != Ok("1") {
        tracing_subscriber::registry()
            .with(filter_or("warn"))
            .with(stderr_layer)
            .init();
        return LogGuard { _file_guard: None };
    }

    let _ = std::fs::create_dir_all(log_dir);
    let (non_blocking, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));

    tracing_subscriber::registry()
        .with(filter_or(FILE_FILTER))
        .with(stderr_layer)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::info!(dir = %log_dir.display(), "file logging enabled");
    LogGuard {
        _file_guard: Some(guard),
    }
}
