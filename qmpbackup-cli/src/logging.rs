//! Logging configuration shared by both CLI binaries.
//!
//! `LoggingConfig` carries level/file-path/json toggle, driven by
//! `-v`/`-vv`, `RUST_LOG`, and `--log-file`, layered with
//! `tracing-appender` for rotation.

use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, registry::Registry, EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logging configuration resolved from CLI flags.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Verbosity count from repeated `-v`; 0 = info, 1 = debug, 2+ = trace.
    pub verbosity: u8,
    pub log_file: Option<PathBuf>,
    pub json: bool,
}

/// Installed subscriber's background appender guard; drop it at the
/// very end of `main` or buffered file writes are lost.
pub struct LoggingGuard(#[allow(dead_code)] Option<tracing_appender::non_blocking::WorkerGuard>);

impl LoggingConfig {
    fn level_filter(&self) -> EnvFilter {
        if std::env::var("RUST_LOG").is_ok() {
            return EnvFilter::from_default_env();
        }
        let level = match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("qmpbackup={level},qmpbackup_core={level},qmpbackup_cli={level}"))
    }

    /// Install the global subscriber. Returns a guard that must be
    /// held for the process lifetime when a log file is configured.
    pub fn init(&self) -> Result<LoggingGuard, std::io::Error> {
        let stderr_layer = fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .with_writer(std::io::stderr);

        let (file_layer, guard) = match &self.log_file {
            Some(path) => {
                let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("qmpbackup.log"));
                let appender = tracing_appender::rolling::never(dir, file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer: BoxedLayer = if self.json {
                    fmt::layer().with_ansi(false).json().with_writer(non_blocking).boxed()
                } else {
                    fmt::layer().with_ansi(false).with_writer(non_blocking).boxed()
                };
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let registry = tracing_subscriber::registry().with(self.level_filter()).with(stderr_layer);

        match file_layer {
            Some(layer) => {
                let _ = registry.with(layer).try_init();
            }
            None => {
                let _ = registry.try_init();
            }
        }

        Ok(LoggingGuard(guard))
    }
}
