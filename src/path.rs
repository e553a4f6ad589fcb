//! Filesystem path helpers for the link manager

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::RawFd;
use std::path::{Component, Path, PathBuf};

/// Compute the relative path from `from_dir` to `to`, the textual target
/// of a published symlink. Both inputs must be absolute; `None` otherwise.
///
/// The result is the shortest `../`-prefixed walk: strip the common
/// leading components, then one `..` per remaining component of
/// `from_dir`, then the remainder of `to`.
pub fn make_relative(from_dir: &Path, to: &Path) -> Option<PathBuf> {
    if !from_dir.is_absolute() || !to.is_absolute() {
        return None;
    }

    let mut from = from_dir
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .peekable();
    let mut dest = to
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .peekable();

    while let (Some(a), Some(b)) = (from.peek(), dest.peek()) {
        if a != b {
            break;
        }
        from.next();
        dest.next();
    }

    let mut rel = PathBuf::new();
    for _ in from {
        rel.push("..");
    }
    for c in dest {
        rel.push(c);
    }

    if rel.as_os_str().is_empty() {
        rel.push(".");
    }

    Some(rel)
}

/// Create every missing parent directory of `path` with the given mode.
/// The final component itself is not created.
pub fn mkdir_parents(path: &Path, mode: u32) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    DirBuilder::new().recursive(true).mode(mode).create(parent)
}

/// Best-effort removal of the now-empty parent chain of `path`, walking
/// upward and stopping at (and never removing) `stop`. Errors end the
/// walk; nothing is reported.
pub fn rmdir_parents(path: &Path, stop: &Path) {
    let mut dir = path.parent();

    while let Some(d) = dir {
        if d == stop || d.as_os_str().is_empty() || d.parent().is_none() {
            break;
        }
        if std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

/// The `/proc/self/fd` door for a raw descriptor. Following this magic
/// link reaches the inode behind an `O_PATH` descriptor, which plain
/// fchmod/futimens refuse to operate on.
pub fn proc_self_fd(fd: RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd))
}
