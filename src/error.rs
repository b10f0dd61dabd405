//! Error taxonomy.
//!
//! A typed [`Error`] enum with the recoverable classes the retrieval pipeline
//! distinguishes: missing/invisible rows ([`Error::NotFound`]), a cold search
//! index ([`Error::IndexNotReady`]), upstream/provider failures
//! ([`Error::Upstream`]), caller-input problems ([`Error::Validation`]), and
//! cancellation ([`Error::Cancelled`]). `sqlx` and `reqwest` failures are
//! classified on conversion; a SQLite "no such table"/"no such module" message
//! is recognized as [`Error::IndexNotReady`] (the FTS5/vector tables not yet
//! created).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed error for the library surface.
#[derive(Debug, Error)]
pub enum Error {
    /// A requested row is absent or not visible to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// A search index (FTS5 or the vector table) is not yet available.
    #[error("index not ready: {0}")]
    IndexNotReady(String),

    /// An upstream provider or dependency failed.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Caller input failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Construct a [`Error::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Construct a [`Error::Upstream`].
    pub fn upstream(message: impl Into<String>) -> Self {
        Error::Upstream(message.into())
    }

    /// Whether this error indicates a search index that is not yet ready.
    pub fn is_index_not_ready(&self) -> bool {
        matches!(self, Error::IndexNotReady(_))
    }
}

/// Recognize a SQLite error message that means a required table/module is
/// missing — i.e. the search index has not been created yet.
fn is_missing_index_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no such table") || lower.contains("no such module")
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        if is_missing_index_message(&message) {
            Error::IndexNotReady(message)
        } else {
            Error::Upstream(message)
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.to_string())
    }
}
