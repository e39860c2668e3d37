//! Jailed file operations behind the HTTP handlers.
//!
//! Every function takes a target that has already been joined under the
//! session's directory by [`Jail::join_entry`], and re-checks it physically
//! with [`Jail::resolve`] before touching the disk.

use crate::confine::Jail;
use crate::error::{is_missing, FsError, FsResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, TryStreamExt};
use serde::Serialize;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, DirBuilder, File};
use tokio::io::AsyncWriteExt;

/// Permissions for directories created on behalf of clients.
pub const DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One line of a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    /// Seconds since the Unix epoch.
    pub modified: i64,
}

/// Lists `dir`, directories first, then by name.
pub async fn list_dir(dir: &Path) -> FsResult<Vec<DirEntryInfo>> {
    let context = "Error listing directory";
    let mut reader = fs::read_dir(dir).await.map_err(FsError::with_context(context))?;
    let mut entries = Vec::new();

    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(FsError::with_context(context))?
    {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // Entry vanished between readdir and stat.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(FsError::io(context, e)),
        };
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
            size: metadata.len(),
            mode: mode_of(&metadata),
            modified: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        });
    }

    entries.sort_by(|a, b| {
        (b.kind == EntryKind::Directory)
            .cmp(&(a.kind == EntryKind::Directory))
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(entries)
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Renders a listing the way `ls -la` would, one entry per line.
pub fn render_listing(entries: &[DirEntryInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "total {}", entries.len());
    for entry in entries {
        let modified = DateTime::<Utc>::from_timestamp(entry.modified, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let suffix = if entry.kind == EntryKind::Directory { "/" } else { "" };
        let _ = writeln!(
            out,
            "{}{} {:>12} {} {}{}",
            kind_char(entry.kind),
            mode_string(entry.mode),
            entry.size,
            modified,
            entry.name,
            suffix
        );
    }
    out
}

fn kind_char(kind: EntryKind) -> char {
    match kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
        EntryKind::Other => '?',
    }
}

fn mode_string(mode: u32) -> String {
    const FLAGS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    FLAGS
        .iter()
        .map(|&(bit, c)| if mode & bit != 0 { c } else { '-' })
        .collect()
}

/// Streams `body` into `target`, replacing any existing file.
///
/// Data lands in a hidden temporary sibling first and is renamed over the
/// target once complete, so readers never see a half-written file.
/// Returns the number of bytes written.
pub async fn write_stream<S, E>(jail: &Jail, target: &Path, body: S) -> FsResult<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let target = jail.resolve(target).await?;
    if fs::metadata(&target).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(FsError::NotAFile);
    }
    let temp = temp_sibling(&target)?;

    let written = match copy_to(&temp, body).await {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
    };
    if let Err(e) = fs::rename(&temp, &target).await {
        let _ = fs::remove_file(&temp).await;
        return Err(FsError::io("Error writing file", e));
    }
    Ok(written)
}

fn temp_sibling(target: &Path) -> FsResult<PathBuf> {
    let name = target.file_name().ok_or(FsError::InvalidFileName)?;
    let temp_name = format!(
        ".{}.{}.part",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    );
    Ok(target.with_file_name(temp_name))
}

async fn copy_to<S, E>(temp: &Path, body: S) -> FsResult<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut file = File::create(temp)
        .await
        .map_err(FsError::with_context("Error creating file"))?;
    let body = body.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    futures_util::pin_mut!(body);

    let mut written = 0u64;
    while let Some(chunk) = body
        .try_next()
        .await
        .map_err(FsError::with_context("Error writing file"))?
    {
        file.write_all(&chunk)
            .await
            .map_err(FsError::with_context("Error writing file"))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(FsError::with_context("Error writing file"))?;
    file.sync_all()
        .await
        .map_err(FsError::with_context("Error writing file"))?;
    Ok(written)
}

/// Opens a regular file for reading; returns it with its length.
pub async fn open_file(jail: &Jail, target: &Path) -> FsResult<(File, u64)> {
    let target = jail.resolve(target).await?;
    let metadata = fs::metadata(&target).await.map_err(|e| {
        if is_missing(&e) {
            FsError::FileNotFound
        } else {
            FsError::io("Error getting file info", e)
        }
    })?;
    if !metadata.is_file() {
        return Err(FsError::NotAFile);
    }
    let file = File::open(&target).await.map_err(|e| {
        if is_missing(&e) {
            FsError::FileNotFound
        } else {
            FsError::io("Error opening file", e)
        }
    })?;
    Ok((file, metadata.len()))
}

/// Removes a file or an empty directory.
pub async fn delete(jail: &Jail, target: &Path) -> FsResult<()> {
    let target = jail.resolve(target).await?;
    let context = "Error deleting file";
    let metadata = fs::symlink_metadata(&target).await.map_err(|e| {
        if is_missing(&e) {
            FsError::FileNotFound
        } else {
            FsError::io(context, e)
        }
    })?;
    let result = if metadata.is_dir() {
        fs::remove_dir(&target).await
    } else {
        fs::remove_file(&target).await
    };
    result.map_err(|e| {
        if is_missing(&e) {
            FsError::FileNotFound
        } else {
            FsError::io(context, e)
        }
    })
}

/// Creates a single directory with [`DIR_MODE`]. Fails if it already exists.
pub async fn create_dir(jail: &Jail, target: &Path) -> FsResult<()> {
    let target = jail.resolve(target).await?;
    let mut builder = DirBuilder::new();
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder
        .create(&target)
        .await
        .map_err(FsError::with_context("Error creating directory"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn setup() -> (TempDir, Jail) {
        let dir = TempDir::new().unwrap();
        let jail = Jail::new(dir.path()).unwrap();
        (dir, jail)
    }

    fn body(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, io::Error>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, jail) = setup();
        let target = jail.root().join("a.txt");

        let written = write_stream(&jail, &target, body(&["hel", "lo"])).await.unwrap();
        assert_eq!(written, 5);

        let (mut file, len) = open_file(&jail, &target).await.unwrap();
        assert_eq!(len, 5);
        let mut content = String::new();
        file.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn write_overwrites_and_leaves_no_temp_files() {
        let (_dir, jail) = setup();
        let target = jail.root().join("a.txt");
        write_stream(&jail, &target, body(&["first version"])).await.unwrap();
        write_stream(&jail, &target, body(&["second"])).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        let names: Vec<_> = std::fs::read_dir(jail.root())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn failed_stream_discards_partial_upload() {
        let (_dir, jail) = setup();
        let target = jail.root().join("broken.bin");
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = write_stream(&jail, &target, failing).await.unwrap_err();
        assert!(matches!(err, FsError::Io { .. }));
        assert_eq!(std::fs::read_dir(jail.root()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn open_distinguishes_missing_and_directory() {
        let (_dir, jail) = setup();
        std::fs::create_dir(jail.root().join("sub")).unwrap();

        assert!(matches!(
            open_file(&jail, &jail.root().join("missing")).await,
            Err(FsError::FileNotFound)
        ));
        assert!(matches!(
            open_file(&jail, &jail.root().join("sub")).await,
            Err(FsError::NotAFile)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn open_refuses_symlink_to_file_outside_root() {
        let (_dir, jail) = setup();
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("secret");
        std::fs::write(&secret, b"s").unwrap();
        let link = jail.root().join("peek");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        assert!(matches!(
            open_file(&jail, &link).await,
            Err(FsError::PathViolation)
        ));
    }

    #[tokio::test]
    async fn path_below_a_regular_file_is_not_found() {
        let (_dir, jail) = setup();
        let file = jail.root().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        assert!(matches!(
            open_file(&jail, &file.join("x")).await,
            Err(FsError::FileNotFound)
        ));
        assert!(matches!(
            delete(&jail, &file.join("x")).await,
            Err(FsError::FileNotFound)
        ));
        assert!(file.exists());
    }

    #[tokio::test]
    async fn delete_file_and_empty_directory() {
        let (_dir, jail) = setup();
        let file = jail.root().join("gone.txt");
        let sub = jail.root().join("empty");
        std::fs::write(&file, b"x").unwrap();
        std::fs::create_dir(&sub).unwrap();

        delete(&jail, &file).await.unwrap();
        delete(&jail, &sub).await.unwrap();
        assert!(!file.exists());
        assert!(!sub.exists());
        assert!(matches!(
            delete(&jail, &file).await,
            Err(FsError::FileNotFound)
        ));
    }

    #[tokio::test]
    async fn delete_of_non_empty_directory_is_an_io_error() {
        let (_dir, jail) = setup();
        let sub = jail.root().join("full");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("keep"), b"x").unwrap();

        assert!(matches!(delete(&jail, &sub).await, Err(FsError::Io { .. })));
        assert!(sub.exists());
    }

    #[tokio::test]
    async fn create_dir_fails_when_it_exists() {
        let (_dir, jail) = setup();
        let target = jail.root().join("foo");
        create_dir(&jail, &target).await.unwrap();
        assert!(target.is_dir());

        let err = create_dir(&jail, &target).await.unwrap_err();
        assert_eq!(err.to_string(), "Error creating directory");
    }

    #[tokio::test]
    async fn listing_puts_directories_first() {
        let (_dir, jail) = setup();
        std::fs::write(jail.root().join("b.txt"), b"12345").unwrap();
        std::fs::write(jail.root().join("a.txt"), b"1").unwrap();
        std::fs::create_dir(jail.root().join("zdir")).unwrap();

        let entries = list_dir(jail.root()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["zdir", "a.txt", "b.txt"]);
        assert_eq!(entries[2].size, 5);
        assert_eq!(entries[0].kind, EntryKind::Directory);

        let text = render_listing(&entries);
        assert!(text.starts_with("total 3\n"));
        assert!(text.contains("zdir/"));
        assert!(text.lines().nth(1).unwrap().starts_with('d'));
    }

    #[test]
    fn mode_string_matches_ls() {
        assert_eq!(mode_string(0o755), "rwxr-xr-x");
        assert_eq!(mode_string(0o640), "rw-r-----");
    }
}
