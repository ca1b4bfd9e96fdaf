use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum OneError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("multiple collections found: {0}")]
    #[diagnostic(help("pass a collection to select exactly one"))]
    MultipleCollectionsFound(String),

    #[error("multiple objects found: {0}")]
    MultipleObjectsFound(String),

    #[error("multiple revisions found: {0}")]
    #[diagnostic(help("pass a revision, or use last-before resolution"))]
    MultipleRevisionsFound(String),

    #[error("no default revision for dataset {0}")]
    NoDefaultRevision(String),

    #[error("invalid ALF path {path}: {reason}")]
    PathFormat { path: String, reason: String },

    #[error("invalid selector {selector}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid refresh mode: {0} (expected local, remote, auto or refresh)")]
    InvalidMode(String),

    #[error("invalid QC value: {0}")]
    InvalidQc(String),

    #[error("invalid session reference: {0}")]
    InvalidSessionRef(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("table {table} is missing identity column {column}")]
    MissingIdentityColumns { table: String, column: String },

    #[error("incoming {table} records carry columns outside the cache schema: {columns}")]
    SchemaMismatch { table: String, columns: String },

    #[error("unknown cache table: {0}")]
    UnknownTable(String),

    #[error("cache directory {0} is locked by another writer")]
    CacheLocked(PathBuf),

    #[error("incompatible cache: {0}")]
    #[diagnostic(help("reload the cache with an explicit tag, or clear the local tables"))]
    IncompatibleCache(String),

    #[error("cache tag not found on remote: {0}")]
    TagNotFound(String),

    #[error("failed to connect to remote catalog: {0}")]
    Connection(String),

    #[error("remote catalog returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("invalid source URL: {0}")]
    InvalidUrl(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("configuration error: {0}")]
    #[diagnostic(help("run `one setup` to create the parameter file"))]
    Configuration(String),

    #[error("missing parameter file one.json")]
    #[diagnostic(help("run `one setup --base-url <URL>` first"))]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl OneError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OneError::NotFound(_) | OneError::HttpStatus { status: 404, .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, OneError::HttpStatus { status: 401 | 403, .. })
    }
}

/// Non-fatal conditions. Every advisory is logged where it is raised and
/// also handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    NoDefaultRevision { dataset: String },
    MultipleRevisions { revisions: Vec<String> },
    MixedOrigins { local: String, remote: String },
    OutdatedClient { required: String, current: String },
    HashMismatch { dataset: String, expected: String, actual: String },
    SizeMismatch { dataset: String, expected: u64, actual: u64 },
    MissingTable { table: String },
    LocalFallback { reason: String },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::NoDefaultRevision { dataset } => {
                write!(f, "No default revision for dataset {dataset}; using most recent")
            }
            Advisory::MultipleRevisions { revisions } => {
                write!(f, "Multiple revisions: \"{}\"", revisions.join("\", \""))
            }
            Advisory::MixedOrigins { local, remote } => write!(
                f,
                "cache tables from origin {local} will be mixed with another origin {remote}"
            ),
            Advisory::OutdatedClient { required, current } => write!(
                f,
                "remote cache requires client version {required} or later (running {current})"
            ),
            Advisory::HashMismatch {
                dataset,
                expected,
                actual,
            } => write!(
                f,
                "hash mismatch for {dataset}: expected {expected}, got {actual}"
            ),
            Advisory::SizeMismatch {
                dataset,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch for {dataset}: expected {expected} bytes, got {actual}"
            ),
            Advisory::MissingTable { table } => write!(f, "no {table} table found in cache"),
            Advisory::LocalFallback { reason } => {
                write!(f, "falling back to local mode: {reason}")
            }
        }
    }
}
