//! Error types shared across the crate.

use std::path::PathBuf;
use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration was rejected before the bias could be initialized.
    #[error("{0}")]
    Input(String),
    /// An underlying file operation failed.
    #[error("{}: {source}", path.display())]
    File {
        /// Path of the file the operation failed on.
        path: PathBuf,
        /// The failing operation.
        source: std::io::Error,
    },
    /// A state, hills or registry stream was malformed.
    #[error("{0}")]
    Parse(String),
    /// An internal invariant was violated; the caller should abort the run.
    #[error("bug: {0}")]
    Bug(String),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wraps an I/O error together with the path it occurred on.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Other(anyhow::Error::new(source))
    }
}

/// Type to short-cut `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
