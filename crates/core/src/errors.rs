//! Error types for the obsgit core library.
//!
//! Each subsystem has its own error type derived with `thiserror`.
//! [`SyncError`] is the per-package error recorded by the export and import
//! engines and wraps all of them.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Metadata errors
// ---------------------------------------------------------------------------

/// Errors from parsing build-service metadata documents.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The document is not well formed or misses a required root field.
    #[error("malformed metadata ({kind}): {detail}")]
    Malformed { kind: String, detail: String },
}

impl MetadataError {
    pub(crate) fn malformed(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Malformed {
            kind: kind.into(),
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Link errors
// ---------------------------------------------------------------------------

/// Errors from classifying and following package links.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A retained link points outside the current project and strict
    /// validation was requested.
    #[error("link {project}/{package} points outside the project (to {target_project}/{target_package})")]
    CrossProject {
        project: String,
        package: String,
        target_project: String,
        target_package: String,
    },

    /// Following links came back to an already visited package.
    #[error("link cycle detected: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    /// An imported link still names a project the target service cannot resolve.
    #[error("link {package} points to unresolved project '{target_project}'")]
    Unresolved {
        package: String,
        target_project: String,
    },

    /// The `_link` document itself could not be parsed.
    #[error("invalid link descriptor: {0}")]
    Metadata(#[from] MetadataError),

    /// Fetching a link or a listing along the chain failed.
    #[error("link resolution remote error: {0}")]
    Remote(#[from] RemoteError),
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from the large-file storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The reference is unknown to the backend.
    #[error("storage miss: '{name}' ({key}) is not stored in the backend")]
    Miss { name: String, key: String },

    /// The backend cannot operate at all with the given settings.
    #[error("storage backend misconfigured: {0}")]
    Misconfigured(String),

    /// The remote blob store failed.
    #[error("storage remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Generic I/O wrapper.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Remote errors
// ---------------------------------------------------------------------------

/// Errors from the build-service API client.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network-level failure (DNS, TLS, timeout, reset).
    #[error("transport error on {url}: {detail}")]
    Transport {
        url: String,
        detail: String,
        retryable: bool,
    },

    /// The API answered with a non-success status code.
    #[error("build service returned HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// The requested project, package or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The answer could not be understood.
    #[error("unexpected build service response: {0}")]
    Response(#[from] MetadataError),

    /// Signing an authentication challenge failed.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl RemoteError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Http { status, .. } => *status >= 500,
            Self::NotFound(_) | Self::Response(_) | Self::Auth(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Local tree errors
// ---------------------------------------------------------------------------

/// Errors from the local git tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// The path is not a git repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2(#[from] git2::Error),

    /// Generic I/O wrapper.
    #[error("tree I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Revision table errors
// ---------------------------------------------------------------------------

/// Errors from reading or writing the revision table.
#[derive(Debug, Error)]
pub enum RevisionError {
    /// A row does not have the `package,revision` shape.
    #[error("malformed revision table at line {line}: {detail}")]
    Malformed { line: usize, detail: String },

    /// Generic I/O wrapper.
    #[error("revision table I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Per-package sync errors
// ---------------------------------------------------------------------------

/// Error recorded for a single package by the export / import engines.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Revision(#[from] RevisionError),

    /// The local tree misses something the operation needs.
    #[error("invalid local tree: {0}")]
    InvalidTree(String),
}

impl SyncError {
    /// Structural errors abort the whole run: every remaining package would
    /// fail the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Misconfigured(_)))
    }
}
