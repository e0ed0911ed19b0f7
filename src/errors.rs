//! Error types shared across the crate.
//!
//! - `BackendError`: any failure talking to a storage backend, normalized so
//!   the engine never inspects vendor-specific errors.
//! - `StoreError`: metadata store failures, including schema migration.
//! - `ConfigError`: invalid configuration, fatal at startup.
//! - `SyncError`: failures that abort a whole mapping.

use std::{error::Error as StdError, fmt, io, path::PathBuf};
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Normalized classification of a backend failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The bucket or object does not exist.
    NotFound,
    /// The operation observed a cancellation request and stopped.
    Cancelled,
    /// The bucket name, key, or payload was rejected before any I/O.
    InvalidInput,
    /// Underlying I/O failed.
    Io,
    Other,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendErrorKind::NotFound => "not found",
            BackendErrorKind::Cancelled => "cancelled",
            BackendErrorKind::InvalidInput => "invalid input",
            BackendErrorKind::Io => "i/o error",
            BackendErrorKind::Other => "error",
        };
        f.write_str(label)
    }
}

/// A failure reported by a storage backend, carrying the original cause.
#[derive(Debug)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    source: Option<BoxError>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(BackendErrorKind::Cancelled, "operation cancelled")
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::InvalidInput, msg)
    }

    /// Wrap an I/O error, mapping `io::ErrorKind::NotFound` to `NotFound`.
    pub fn io(msg: impl Into<String>, err: io::Error) -> Self {
        let kind = if err.kind() == io::ErrorKind::NotFound {
            BackendErrorKind::NotFound
        } else {
            BackendErrorKind::Io
        };
        Self::new(kind, msg).with_source(err)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == BackendErrorKind::Cancelled
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)?;
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl StdError for BackendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot prepare metadata store location {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot open metadata store: {0}")]
    Open(#[source] sqlx::Error),
    #[error("schema migration to version {version} failed: {source}")]
    Schema {
        version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("metadata store is closed")]
    Closed,
    #[error("invalid record for `{object_name}`: {reason}")]
    InvalidRecord { object_name: String, reason: String },
    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse configuration {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot write configuration {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("configuration must contain at least one provider")]
    NoProviders,
    #[error("configuration must contain at least one bucket mapping")]
    NoMappings,
    #[error("duplicate provider id `{0}`")]
    DuplicateProvider(String),
    #[error("mapping {index} references unknown {side} provider `{provider_id}`")]
    UnknownMappingProvider {
        index: usize,
        side: &'static str,
        provider_id: String,
    },
    #[error("mapping {index} has an empty {side} bucket name")]
    EmptyBucket { index: usize, side: &'static str },
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("provider `{0}` is not registered")]
    UnknownProvider(String),
    #[error("cannot initialize provider `{id}`: {source}")]
    Backend {
        id: String,
        #[source]
        source: BackendError,
    },
}

/// A failure that aborts synchronization of one mapping.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider `{0}` is not registered")]
    UnknownProvider(String),
    #[error("cannot list source bucket `{bucket}`: {source}")]
    ListSource {
        bucket: String,
        #[source]
        source: BackendError,
    },
    #[error("cannot list target bucket `{bucket}`: {source}")]
    ListTarget {
        bucket: String,
        #[source]
        source: BackendError,
    },
    #[error("cannot ensure target bucket `{bucket}` exists: {source}")]
    EnsureTarget {
        bucket: String,
        #[source]
        source: BackendError,
    },
    #[error("synchronization cancelled")]
    Cancelled,
}
