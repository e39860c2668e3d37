//! Directory navigation for a session.
//!
//! A session's state is nothing more than its current directory. A change
//! request computes a candidate directory, validates it against the jail and
//! the filesystem, and hands it back for the caller to commit to the store.

use crate::confine::{join_relative, Jail};
use crate::error::{is_missing, FsError, FsResult};
use std::io;
use std::path::{Path, PathBuf};

/// Characters stripped from both ends of a client-supplied directory name.
const NAME_TRIM: &[char] = &['/', '\\', ' ', '"'];

/// Keyword that jumps back to the top of the jail.
pub const ROOT_KEYWORD: &str = "root";

/// A parsed directory-change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirTarget {
    Parent,
    Root,
    Child(String),
}

impl DirTarget {
    pub fn parse(input: &str) -> FsResult<Self> {
        match trim_name(input)? {
            ".." => Ok(Self::Parent),
            ROOT_KEYWORD => Ok(Self::Root),
            name => Ok(Self::Child(name.to_string())),
        }
    }

    /// The lexical candidate for this target, before any validation.
    fn candidate(&self, current_dir: &Path, root: &Path) -> PathBuf {
        match self {
            // `Path::parent` of the root directory is None; stay put lexically.
            Self::Parent => current_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| current_dir.to_path_buf()),
            Self::Root => root.to_path_buf(),
            Self::Child(name) => join_relative(current_dir, name),
        }
    }
}

/// Trims slashes, backslashes, spaces and quotes; rejects what is left empty.
pub fn trim_name(input: &str) -> FsResult<&str> {
    let name = input.trim_matches(NAME_TRIM);
    if name.is_empty() {
        Err(FsError::InvalidDirectoryName)
    } else {
        Ok(name)
    }
}

/// Computes the directory a session moves to from `current_dir`.
///
/// `..` from root yields a lexical candidate above root; the jail rejects it
/// like any other escape. Nothing on disk changes.
pub async fn navigate(current_dir: &Path, input: &str, jail: &Jail) -> FsResult<PathBuf> {
    let target = DirTarget::parse(input)?;
    let candidate = target.candidate(current_dir, jail.root());

    if !jail.contains(&candidate) {
        tracing::warn!(?target, "directory change escapes root");
        return Err(FsError::PathViolation);
    }

    let metadata = tokio::fs::metadata(&candidate).await.map_err(|e| {
        if is_missing(&e) {
            FsError::DirectoryNotFound
        } else {
            FsError::io("Error accessing directory", e)
        }
    })?;
    if !metadata.is_dir() {
        return Err(FsError::NotADirectory);
    }

    jail.resolve(&candidate).await
}
