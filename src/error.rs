//! Error types for the install engine.
//!
//! Catalog and fetch errors are typed so callers can tell a broken catalog
//! from a flaky network. Per-package failures are captured as
//! [`InstallFailure`] values inside an outcome instead of aborting a batch.

use std::{io, path::PathBuf};
use thiserror::Error;

/// A catalog record that cannot be turned into a package descriptor.
#[derive(Debug, Error)]
pub enum CatalogFormatError {
    #[error("catalog record #{index} has no id")]
    MissingId { index: usize },

    #[error("catalog record {id} has no version")]
    MissingVersion { id: String },

    #[error("catalog record {id} has no download url")]
    MissingDownloadUrl { id: String },

    #[error("catalog payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure while streaming an archive from its source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },

    #[error("connection to {url} failed: {message}")]
    Connection { url: String, message: String },

    #[error("writing download of {url} failed: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },
}

/// Archive-level failures, split by whether the bytes or the disk are at fault.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{0}")]
    Corrupt(String),

    #[error("{0}")]
    Extraction(String),
}

impl ArchiveError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }
}

/// Why a single package in a batch did not install.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("network timeout: {0}")]
    Timeout(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl From<FetchError> for InstallFailure {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { .. } => InstallFailure::Timeout(err.to_string()),
            // A local write failure is a filesystem problem, not a network one.
            FetchError::Io { .. } => InstallFailure::Extraction(err.to_string()),
            FetchError::Http { .. } | FetchError::Connection { .. } => {
                InstallFailure::Network(err.to_string())
            }
        }
    }
}

impl From<ArchiveError> for InstallFailure {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Corrupt(msg) => InstallFailure::CorruptArchive(msg),
            ArchiveError::Extraction(msg) => InstallFailure::Extraction(msg),
        }
    }
}

/// Errors that abort a whole install operation rather than one item.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("loader is not installed ({} is missing); install it first", .0.display())]
    MissingPrerequisite(PathBuf),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("install state unavailable: {0}")]
    State(String),

    #[error("another install is already running for this target")]
    Busy,

    #[error("no game directory is known; pass --root or set game_root in the config")]
    NoTarget,
}

impl From<ArchiveError> for InstallError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Corrupt(msg) => InstallError::CorruptArchive(msg),
            ArchiveError::Extraction(msg) => InstallError::Extraction(msg),
        }
    }
}
