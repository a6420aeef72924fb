//! Error taxonomy for the orchestrator, monitor client, and restore
//! engine.

use std::path::PathBuf;

/// The class/desc pair a monitor command error carries.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub class: String,
    pub desc: String,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

/// Top-level error for everything `qmpbackup-core` can fail with.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Taxonomy 1: bad flags, include+exclude, empty device set, etc.
    /// Raised before any side effects occur.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Taxonomy 2: connect/handshake failure or unexpected disconnect.
    #[error("monitor transport error: {0}")]
    Transport(String),

    /// Taxonomy 3: a monitor verb returned a structured error.
    #[error("monitor command failed: {0}")]
    Command(#[from] CommandError),

    /// Taxonomy 4: BLOCK_JOB_ERROR / BLOCK_JOB_CANCELLED.
    #[error("backup job failed for device {device}: {reason}")]
    JobFailed { device: String, reason: String },

    /// Taxonomy 5: directory creation, rename, symlink, unlink, uuid
    /// read/write.
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Taxonomy 6: a signal was caught during the run.
    #[error("run aborted by signal")]
    SignalCaught,

    /// Taxonomy 7: restore chain is missing a FULL, has multiple
    /// FULLs, contains a `.partial`, or fails continuity/consistency
    /// checks.
    #[error("restore chain error: {0}")]
    Chain(String),

    /// The external image tool exited non-zero.
    #[error("tool '{tool}' failed (exit {code:?}): {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl CoreError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Filesystem {
            path: path.into(),
            source,
        }
    }
}
