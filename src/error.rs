//! Error types for stackfs

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for stackfs
#[derive(Error, Debug)]
pub enum Error {
    // Resolution errors
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The link half of a rename succeeded but the unlink half failed, so
    /// both names are live.
    #[error("Rename {from} -> {to} left both names in place: {source}")]
    PartialRename {
        from: String,
        to: String,
        #[source]
        source: Box<Error>,
    },

    // Filesystem errors
    #[error("Invalid file handle: {0}")]
    InvalidFileHandle(u64),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to libc errno for FUSE
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidFileHandle(_) => libc::EBADF,
            Error::PartialRename { source, .. } => source.to_errno(),
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Database(sled::Error::Io(e)) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Whether this error means the path has no live entry
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Error::Database(e),
        }
    }
}
