//! Tracing setup and the per-run text log.

use crate::error::CoreError;
use crate::persistence::append_line;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// File name of the structured log inside the trace directory.
pub const TRACE_FILE_NAME: &str = "modista.log";

/// Map `-v` / `-q` flags onto a filter directive.
pub fn level_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber: human-readable stderr plus JSON file logging.
///
/// `RUST_LOG` takes precedence over the verbosity flags for the stderr layer.
/// When `trace_dir` is given, a JSON layer at `debug` level is written to
/// `<trace_dir>/modista.log`; the returned guard must be kept alive until exit
/// so buffered lines are flushed.
pub fn init_tracing(
    verbose: u8,
    quiet: bool,
    trace_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, CoreError> {
    let filter = level_filter(verbose, quiet);
    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(stderr_filter);

    let (json_layer, guard) = match trace_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::never(dir, TRACE_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| CoreError::Logging {
            message: e.to_string(),
        })?;

    Ok(guard)
}

/// Append-only text log of one training run.
///
/// Each message becomes one timestamped line in the run's `.log` file and is
/// mirrored to `tracing` when `echo` is set.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    echo: bool,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>, echo: bool) -> Self {
        Self {
            path: path.into(),
            echo,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if self.echo {
            tracing::info!("{message}");
        }
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = append_line(&self.path, &format!("[{stamp}] {message}")) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append to run log");
        }
    }
}
