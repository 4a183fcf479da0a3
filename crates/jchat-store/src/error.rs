use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Generic I/O error (creating directories, reading or writing files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A user, group or file name that cannot be used as a path component.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// A record field that would break the line-oriented log format.
    #[error("Invalid record field: {0:?}")]
    InvalidField(String),

    /// The target path escapes the store's base directory.
    #[error("Path traversal detected")]
    PathTraversal,

    /// A file with the same name was already uploaded for this pair.
    #[error("File already exists: {0}")]
    AlreadyExists(String),

    /// The requested file does not exist.
    #[error("File not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
