use crate::fsutil::{SpecialFiles, clear_dir, copy_tree, remove_tree};
use std::os::unix::fs::symlink;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

/// Failure to capture a protected directory. Nothing has been mutated yet
/// when this is returned.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Protected path {0:?} does not exist")]
    Missing(PathBuf),
    #[error("Protected path {0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("Snapshot storage {storage:?} lies inside protected path {path:?}")]
    StorageInsideProtected { path: PathBuf, storage: PathBuf },
    #[error("Failed to capture {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A protected directory could not be put back. Every later build would run
/// against a tree of unknown state, so callers treat this as fatal.
#[derive(Error, Debug)]
#[error("Failed to restore {path:?}: {source}")]
pub struct RestoreError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// A full copy of a directory tree taken before a mutating step.
///
/// Contents, permissions, timestamps and symlink targets are kept in a
/// private temporary directory that goes away once the snapshot has been
/// restored or dropped. A protected path that is a symlink is captured and
/// restored through the directory it points to, and the link itself is put
/// back if the step replaced it.
#[derive(Debug)]
pub struct DirectorySnapshot {
    path: PathBuf,
    resolved: PathBuf,
    link: Option<PathBuf>,
    storage: TempDir,
}

impl DirectorySnapshot {
    pub fn capture(path: &Path) -> Result<Self, SnapshotError> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing(path.to_path_buf()));
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if !meta.is_dir() {
            return Err(SnapshotError::NotADirectory(path.to_path_buf()));
        }

        let io_err = |source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };
        let storage = tempfile::Builder::new()
            .prefix("rcfuzzer-snapshot-")
            .tempdir()
            .map_err(io_err)?;

        let canonical = path.canonicalize().map_err(io_err)?;
        let storage_canonical = storage.path().canonicalize().map_err(io_err)?;
        if storage_canonical.starts_with(&canonical) {
            return Err(SnapshotError::StorageInsideProtected {
                path: path.to_path_buf(),
                storage: storage_canonical,
            });
        }

        let link = match fs::symlink_metadata(path).map_err(io_err)? {
            meta if meta.file_type().is_symlink() => Some(fs::read_link(path).map_err(io_err)?),
            _ => None,
        };

        let snapshot = Self {
            path: path.to_path_buf(),
            resolved: canonical,
            link,
            storage,
        };
        copy_tree(
            &snapshot.resolved,
            &snapshot.tree(),
            false,
            SpecialFiles::Reject,
        )
        .map_err(io_err)?;
        log::debug!("Captured snapshot of {:?}", snapshot.path);
        Ok(snapshot)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory the snapshot was taken of, with symlinks resolved.
    pub fn resolved(&self) -> &Path {
        &self.resolved
    }

    fn tree(&self) -> PathBuf {
        self.storage.path().join("tree")
    }

    /// Puts the directory back exactly as captured, consuming the snapshot.
    pub fn restore(self) -> Result<(), RestoreError> {
        let err = |source| RestoreError {
            path: self.path.clone(),
            source,
        };
        match fs::symlink_metadata(&self.resolved) {
            Ok(meta) if meta.is_dir() => clear_dir(&self.resolved).map_err(err)?,
            Ok(_) => fs::remove_file(&self.resolved).map_err(err)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(err(e)),
        }
        copy_tree(&self.tree(), &self.resolved, false, SpecialFiles::Reject).map_err(err)?;
        if let Some(target) = &self.link {
            relink(&self.path, target).map_err(err)?;
        }
        log::debug!("Restored {:?}", self.path);
        Ok(())
    }
}

fn relink(path: &Path, target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(path)? == target {
                return Ok(());
            }
            fs::remove_file(path)?;
        }
        Ok(meta) if meta.is_dir() => remove_tree(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink(target, path)
}

/// Scoped protection over a set of directories.
///
/// Created by [`protect`]. Call [`ProtectGuard::release`] to restore and see
/// the outcome; if the guard is dropped instead (early return, panic) it
/// restores on its own, and a restore failure at that point aborts the
/// process.
#[must_use = "dropping the guard restores the protected directories immediately"]
#[derive(Debug)]
pub struct ProtectGuard {
    snapshots: Vec<DirectorySnapshot>,
}

/// Snapshots every path in `paths`, in order. Paths naming the same
/// directory are captured once.
pub fn protect<P: AsRef<Path>>(paths: &[P]) -> Result<ProtectGuard, SnapshotError> {
    let mut snapshots: Vec<DirectorySnapshot> = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        let resolved = path.canonicalize().ok();
        if snapshots
            .iter()
            .any(|s| s.path() == path || resolved.as_deref() == Some(s.resolved()))
        {
            continue;
        }
        snapshots.push(DirectorySnapshot::capture(path)?);
    }
    Ok(ProtectGuard { snapshots })
}

impl ProtectGuard {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.snapshots.iter().map(|s| s.path())
    }

    /// Restores every snapshot, most recent first. All snapshots are
    /// attempted; the first failure is returned.
    pub fn release(mut self) -> Result<(), RestoreError> {
        self.restore_all()
    }

    fn restore_all(&mut self) -> Result<(), RestoreError> {
        let mut first_error = None;
        while let Some(snapshot) = self.snapshots.pop() {
            if let Err(e) = snapshot.restore() {
                log::error!("{e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ProtectGuard {
    fn drop(&mut self) {
        if self.snapshots.is_empty() {
            return;
        }
        log::warn!("Protection scope left without release, restoring");
        if self.restore_all().is_err() {
            log::error!("Protected directories could not be restored, aborting");
            std::process::abort();
        }
    }
}
