//! Error type shared by every parser in the crate.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias used across `prockit-core`.
pub type Result<T> = std::result::Result<T, ProcfsError>;

/// Errors returned by parsers, the PID/TID list cache and the qdisc collector.
#[derive(Debug, Error)]
pub enum ProcfsError {
    /// A file could not be opened or read.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Malformed content: bad digit, missing field or delimiter, trailing garbage.
    #[error("{}#{line_num}: {line:?}: {reason}", path.display())]
    Syntax {
        path: PathBuf,
        line_num: usize,
        line: String,
        reason: String,
    },

    /// The read filled the pool's size limit, so the content may be cut short.
    #[error("{}: potentially truncated, read limit of {max_read_size} bytes reached", path.display())]
    Truncated { path: PathBuf, max_read_size: usize },

    /// The file layout no longer matches what was pinned on the first parse.
    #[error("{}: {reason}", path.display())]
    Schema { path: PathBuf, reason: String },

    /// The netlink transport of the qdisc collector failed.
    #[error("netlink {op}: {source}")]
    Netlink {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0}: not supported on this platform")]
    Unsupported(&'static str),

    #[error("invalid partition {partition} (num_partitions: {num_partitions})")]
    InvalidPartition {
        partition: usize,
        num_partitions: usize,
    },
}

impl ProcfsError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a syntax error; `line` is decoded lossily for display.
    pub fn syntax(path: &Path, line_num: usize, line: &[u8], reason: impl Into<String>) -> Self {
        Self::Syntax {
            path: path.to_path_buf(),
            line_num,
            line: String::from_utf8_lossy(line).into_owned(),
            reason: reason.into(),
        }
    }

    pub fn schema(path: &Path, reason: impl Into<String>) -> Self {
        Self::Schema {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for a missing file, which callers scraping
    /// short-lived processes usually treat as "gone".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}
