//! Path confinement.
//!
//! Two layers keep every resolved path inside the root:
//! - [`is_within_root`] is a pure, lexical test on cleaned absolute paths,
//!   comparing whole segments case-insensitively.
//! - [`Jail::resolve`] repeats that test and then resolves symlinks on the
//!   deepest existing ancestor, so a link cannot point a session out of root.

use crate::error::{FsError, FsResult};
use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Lexically normalizes `path`: drops `.` segments, applies `..` to the
/// preceding segment and never climbs above the filesystem root.
///
/// The filesystem is not consulted, so symlinks are left untouched.
pub fn clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Returns true iff the cleaned `candidate` equals `root` or lies beneath it.
///
/// Segments are compared ASCII-case-insensitively, so `/SRV/Data/x` is inside
/// `/srv/data`, while `/srv/data2` is not. Relative candidates are rejected.
pub fn is_within_root(candidate: &Path, root: &Path) -> bool {
    if !candidate.is_absolute() {
        return false;
    }
    let candidate = clean(candidate);
    let root = clean(root);
    let mut segments = candidate.components();
    root.components()
        .all(|r| matches!(segments.next(), Some(c) if segment_eq(c.as_os_str(), r.as_os_str())))
}

/// Joins `name` onto `base` as a relative path and cleans the result.
///
/// Leading separators and drive prefixes in `name` are dropped, so an
/// absolute-looking name still lands under `base`.
pub fn join_relative(base: &Path, name: &str) -> PathBuf {
    let relative: PathBuf = Path::new(name.trim_start_matches(['/', '\\']))
        .components()
        .filter(|c| {
            matches!(
                c,
                Component::Normal(_) | Component::ParentDir | Component::CurDir
            )
        })
        .collect();
    clean(&base.join(relative))
}

fn segment_eq(a: &OsStr, b: &OsStr) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// The confinement boundary for a whole server: a canonical root directory.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    /// Canonicalizes `root` and checks that it is a directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root is not a directory: {}", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexical containment check against this root.
    pub fn contains(&self, candidate: &Path) -> bool {
        is_within_root(candidate, &self.root)
    }

    /// Joins a client-supplied `name` onto `base` (always relative, see
    /// [`join_relative`]) and rejects the result if it leaves the root. Root
    /// itself is accepted.
    pub fn join(&self, base: &Path, name: &str) -> FsResult<PathBuf> {
        let candidate = join_relative(base, name);
        if self.contains(&candidate) {
            Ok(candidate)
        } else {
            Err(FsError::PathViolation)
        }
    }

    /// Like [`Jail::join`], but the result must name an entry strictly below
    /// root. Used for targets of upload, download, delete and mkdir.
    pub fn join_entry(&self, base: &Path, name: &str) -> FsResult<PathBuf> {
        let candidate = self.join(base, name)?;
        if self.is_root(&candidate) {
            return Err(FsError::PathViolation);
        }
        Ok(candidate)
    }

    fn is_root(&self, path: &Path) -> bool {
        clean(path).components().count() == self.root.components().count()
    }

    /// Physical containment check.
    ///
    /// Canonicalizes the deepest existing ancestor of `candidate` and requires
    /// it to sit under the canonical root. A dangling symlink anywhere on the
    /// path is rejected.
    pub async fn resolve(&self, candidate: &Path) -> FsResult<PathBuf> {
        let candidate = clean(candidate);
        if !self.contains(&candidate) {
            return Err(FsError::PathViolation);
        }

        for ancestor in candidate.ancestors() {
            match tokio::fs::canonicalize(ancestor).await {
                Ok(real) => {
                    return if real.starts_with(&self.root) {
                        Ok(candidate)
                    } else {
                        tracing::warn!(path = %candidate.display(), "symlink escapes root");
                        Err(FsError::PathViolation)
                    };
                }
                // A missing ancestor, or one that runs through a regular file.
                Err(e) if crate::error::is_missing(&e) => {
                    if tokio::fs::symlink_metadata(ancestor).await.is_ok() {
                        return Err(FsError::PathViolation);
                    }
                }
                Err(e) => return Err(FsError::io("Error accessing path", e)),
            }
        }
        Err(FsError::PathViolation)
    }

    /// Renders `path` relative to root with a leading `/`; root is `/`.
    pub fn virtual_path(&self, path: &Path) -> String {
        let skip = self.root.components().count();
        let segments: Vec<String> = clean(path)
            .components()
            .skip(skip)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", segments.join("/"))
    }
}
