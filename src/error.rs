//! Crate-wide error taxonomy.
//!
//! Callers match on variants to distinguish "absent" from "invalid" from
//! "broken": [`Error::NotFound`] and [`Error::DuplicatePath`] are ordinary
//! outcomes a UI can surface inline, while [`Error::Database`] and
//! [`Error::Io`] indicate the store itself is unhealthy.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lookup by id or path matched no row.
    #[error("not found: {0}")]
    NotFound(String),

    /// An asset already exists at the given path.
    #[error("an asset already exists at {0}")]
    DuplicatePath(String),

    /// Caller-supplied input was rejected before touching the database.
    #[error("{0}")]
    Validation(String),

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}
