//! Logging setup
//!
//! Console output goes to stderr at a level picked by the number of `-v`
//! flags. A run can additionally scope a file-backed subscriber to itself,
//! writing `output.log` and `error.log` into its output directory.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::constants::{ERROR_LOG_FILE, OUTPUT_LOG_FILE};
use crate::error::{EmbeddingError, Result};

/// `-v` count to console level: none is silent, five or more is TRACE
pub fn verbosity_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global stderr subscriber
///
/// `RUST_LOG` overrides the `-v` level when set. Calling this twice is
/// harmless; the second install is ignored.
pub fn setup_cmd_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(verbosity_level(verbosity).into()));
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter),
        )
        .try_init();
}

/// Subscriber for the duration of one run
///
/// Mirrors the console at `console` level and adds the two log files.
pub fn run_log_dispatch(outdir: &Path, console: LevelFilter) -> Result<Dispatch> {
    let output = open_log(&outdir.join(OUTPUT_LOG_FILE))?;
    let errors = open_log(&outdir.join(ERROR_LOG_FILE))?;

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(output)
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(errors)
                .with_ansi(false)
                .with_filter(LevelFilter::ERROR),
        );
    Ok(Dispatch::new(subscriber))
}

fn open_log(path: &Path) -> Result<Arc<File>> {
    let file = File::create(path).map_err(|e| EmbeddingError::file_access(path, e))?;
    Ok(Arc::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LevelFilter::OFF, verbosity_level(0));
        assert_eq!(LevelFilter::INFO, verbosity_level(3));
        assert_eq!(LevelFilter::TRACE, verbosity_level(9));
    }

    #[test]
    fn test_run_dispatch_splits_levels() {
        let dir = tempfile::tempdir().unwrap();
        let dispatch = run_log_dispatch(dir.path(), LevelFilter::OFF).unwrap();
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("pipeline started");
            tracing::error!("pipeline failed");
        });

        let output = std::fs::read_to_string(dir.path().join(OUTPUT_LOG_FILE)).unwrap();
        let errors = std::fs::read_to_string(dir.path().join(ERROR_LOG_FILE)).unwrap();
        assert!(output.contains("pipeline started"));
        assert!(output.contains("pipeline failed"));
        assert!(!errors.contains("pipeline started"));
        assert!(errors.contains("pipeline failed"));
    }
}
