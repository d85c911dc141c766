//! Error taxonomy of the library
//!
//! Fatal conditions get their own variant so that callers can branch on
//! them. Recoverable per-line and per-record problems (malformed lines,
//! non-URL owners, unrouteable domains) never show up here: they are logged
//! and skipped where they happen.

use thiserror::Error;

/// Result type used throughout the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while accessing the corpus
#[derive(Debug, Error)]
pub enum Error {
    /// Cache miss while network access is disallowed
    #[error("refusing to fetch {url} with network access disabled, and {key} is not cached")]
    Offline { url: Box<str>, key: Box<str> },

    /// Upstream broke the HTTP contract that caching decisions rely on
    #[error("protocol violation while fetching {url}: {message}")]
    Protocol { url: Box<str>, message: Box<str> },

    /// Mutation attempted on a read-only cache
    #[error("cannot write {key} into a read-only cache")]
    ReadOnly { key: Box<str> },

    /// A line of the record format did not hold exactly one record
    #[error("line {line} of the record stream does not hold exactly one record ({count} parsed)")]
    ParseInvariant { line: u64, count: usize },

    /// A domain that statistics promised never showed up in the source file
    #[error("no records of class {class} were found for domain {domain}")]
    DatasetNotFound { class: Box<str>, domain: Box<str> },

    /// Cache key segment that cannot be mapped to a path component
    #[error("invalid cache key segment {0:?}")]
    InvalidKey(Box<str>),

    /// URL that cannot be used as a fetch target
    #[error("cannot fetch {url}: {reason}")]
    InvalidUrl { url: Box<str>, reason: &'static str },

    /// Requested class does not exist in this corpus version
    #[error("unknown class: {0}")]
    UnknownClass(Box<str>),

    /// Requested domain is not listed in the class statistics
    #[error("unknown domain {domain} for class {class}")]
    UnknownDomain { class: Box<str>, domain: Box<str> },

    /// Corpus metadata did not have the expected shape
    #[error("malformed corpus metadata: {0}")]
    Metadata(Box<str>),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Tabular metadata could not be decoded
    #[error("CSV error: {0}")]
    Csv(#[from] csv_async::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Background task panicked or was cancelled
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
//
impl Error {
    /// Build a protocol error
    pub fn protocol(url: &str, message: impl Into<Box<str>>) -> Self {
        Self::Protocol {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Build a metadata error
    pub fn metadata(message: impl Into<Box<str>>) -> Self {
        Self::Metadata(message.into())
    }
}
