//! Errors raised by the jail, the navigator and the file operations.

use std::io;
use thiserror::Error;

/// Failure of a jailed filesystem operation.
///
/// The `Display` text of every variant is safe to show to a client: no variant
/// carries a resolved filesystem path. `Io` keeps its source for server-side logs.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("Invalid directory name")]
    InvalidDirectoryName,

    #[error("Invalid file name")]
    InvalidFileName,

    /// The candidate path escapes the root.
    #[error("Invalid path")]
    PathViolation,

    #[error("File not found")]
    FileNotFound,

    #[error("Directory not found")]
    DirectoryNotFound,

    #[error("Not a directory")]
    NotADirectory,

    #[error("Not a file")]
    NotAFile,

    #[error("{context}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Returns a closure for `map_err` that wraps an I/O error with `context`.
    pub fn with_context(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::io(context, source)
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// True when `err` means the path does not exist, including a path that
/// continues below a regular file.
pub(crate) fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_displays_only_its_context() {
        let err = FsError::io(
            "Error deleting file",
            io::Error::new(io::ErrorKind::PermissionDenied, "/srv/data/secret: denied"),
        );
        assert_eq!(err.to_string(), "Error deleting file");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn missing_covers_paths_below_a_file() {
        assert!(is_missing(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(is_missing(&io::Error::from(io::ErrorKind::NotADirectory)));
        assert!(!is_missing(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn path_violation_does_not_leak_paths() {
        assert_eq!(FsError::PathViolation.to_string(), "Invalid path");
    }
}
