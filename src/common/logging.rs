use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// Engine events always go to a daily rolling file under `logs_dir`
/// (`fspurge.log.YYYY-MM-DD`). With `verbose` they are mirrored to stderr
/// at debug level. `RUST_LOG` overrides both filters.
///
/// The returned guard must be kept alive until exit so buffered lines are
/// flushed. Returns `None` when a subscriber is already installed.
pub fn init(verbose: bool, logs_dir: &Path) -> Option<WorkerGuard> {
    let default_filter = if verbose { "fspurge=debug" } else { "fspurge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // A missing log dir is not fatal; fall back to stderr only.
    let file_layer = match std::fs::create_dir_all(logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(logs_dir, "fspurge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some((fmt::layer().with_writer(writer).with_ansi(false), guard))
        }
        Err(_) => None,
    };

    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
    });

    let (file_layer, guard) = match file_layer {
        Some((layer, guard)) => (Some(layer), Some(guard)),
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        guard
    } else {
        None
    }
}
