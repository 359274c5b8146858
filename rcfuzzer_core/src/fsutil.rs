//! Tree copy helpers shared by snapshots and engine installs.

use std::fs::{self, File, FileTimes, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;
use walkdir::WalkDir;

/// What [`copy_tree`] does with FIFOs, sockets and device nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialFiles {
    Skip,
    /// Fail with `ErrorKind::Unsupported`; the copy would not be faithful.
    Reject,
}

/// Recursively copies the contents of `src` into `dst`, creating `dst` if
/// needed. Permissions and timestamps are carried over for files and
/// directories. With `follow_symlinks == false` links are recreated verbatim.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    follow_symlinks: bool,
    special: SpecialFiles,
) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src)
        .min_depth(1)
        .follow_links(follow_symlinks)
        .sort_by_file_name()
    {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target)?;
            dirs.push((target, entry.metadata()?));
        } else if file_type.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            apply_metadata(&target, &entry.metadata()?)?;
        } else if special == SpecialFiles::Reject {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot copy special file {:?}", entry.path()),
            ));
        } else {
            log::warn!("Skipping special file {:?}", entry.path());
        }
    }

    // Directory metadata goes last, deepest first, so read-only directories
    // and their mtimes are not disturbed by the copies into them.
    for (dir, meta) in dirs.iter().rev() {
        apply_metadata(dir, meta)?;
    }
    apply_metadata(dst, &fs::metadata(src)?)
}

fn apply_metadata(path: &Path, meta: &Metadata) -> io::Result<()> {
    let mode = meta.permissions().mode();
    let readable = if meta.is_dir() { 0o500 } else { 0o400 };
    if mode & readable != readable {
        fs::set_permissions(path, Permissions::from_mode(mode | readable))?;
    }
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    File::open(path)?.set_times(times)?;
    fs::set_permissions(path, meta.permissions())
}

/// Removes everything below `dir`, leaving `dir` itself in place.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    make_owner_writable(dir)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Removes `dir` and everything below it, read-only entries included.
pub fn remove_tree(dir: &Path) -> io::Result<()> {
    clear_dir(dir)?;
    fs::remove_dir(dir)
}

// Hand-rolled rather than WalkDir: a directory has to become readable before
// anything can list it.
fn make_owner_writable(dir: &Path) -> io::Result<()> {
    let mode = fs::symlink_metadata(dir)?.permissions().mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(dir, Permissions::from_mode(mode | 0o700))?;
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_owner_writable(&entry.path())?;
        }
    }
    Ok(())
}
