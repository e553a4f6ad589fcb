//! Idempotent, atomic publication of device node symlinks

use crate::device::Device;
use crate::error::{Error, Result};
use crate::path::{make_relative, mkdir_parents};
use crate::seclabel;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::debug;

/// What publishing a link actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// An identical link was already in place and was preserved
    Unchanged,
    /// The link did not exist and was created directly
    Created,
    /// An existing entry was atomically replaced through a staging name.
    /// The replaced entry may have been another worker's view of this
    /// link, so the caller must re-check the claim index.
    Replaced,
}

/// Publish a relative symlink to `node` at `slink`.
///
/// An existing symlink with the correct target is preserved (label and
/// timestamp refreshed). A real block or character device node at
/// `slink` is never touched. Anything else is replaced by writing the
/// new link to `<slink>.tmp-<device-id>` and renaming it into place.
pub fn node_symlink(dev: &Device, node: &Path, slink: &Path) -> Result<LinkOutcome> {
    let slink_dir = slink
        .parent()
        .ok_or_else(|| Error::BadPath(slink.to_path_buf()))?;
    let target =
        make_relative(slink_dir, node).ok_or_else(|| Error::BadPath(slink.to_path_buf()))?;

    match std::fs::symlink_metadata(slink) {
        Ok(md) => {
            let fmt = md.mode() & libc::S_IFMT;
            if fmt == libc::S_IFBLK || fmt == libc::S_IFCHR {
                debug!(
                    "Conflicting device node '{}' found, link to '{}' will not be created",
                    slink.display(),
                    node.display()
                );
                return Err(Error::Conflict(slink.to_path_buf()));
            }
            if md.file_type().is_symlink() {
                if let Ok(existing) = std::fs::read_link(slink) {
                    if existing == target {
                        debug!(
                            "Preserve already existing symlink '{}' to '{}'",
                            slink.display(),
                            target.display()
                        );
                        seclabel::label_fix(slink);
                        touch_nofollow(slink);
                        return Ok(LinkOutcome::Unchanged);
                    }
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(
                "Creating symlink '{}' to '{}'",
                slink.display(),
                target.display()
            );
            match symlink_with_parents(&target, slink) {
                Ok(()) => return Ok(LinkOutcome::Created),
                Err(e) => debug!(
                    "Failed to create symlink '{}', trying to replace it: {}",
                    slink.display(),
                    e
                ),
            }
        }
        Err(e) => return Err(e.into()),
    }

    debug!("Atomically replace '{}'", slink.display());
    let mut staging_name = slink
        .file_name()
        .ok_or_else(|| Error::BadPath(slink.to_path_buf()))?
        .to_os_string();
    staging_name.push(format!(".tmp-{}", dev.device_id()));
    let staging = slink.with_file_name(staging_name);

    let _ = std::fs::remove_file(&staging);
    symlink_with_parents(&target, &staging)?;

    if let Err(e) = std::fs::rename(&staging, slink) {
        let _ = std::fs::remove_file(&staging);
        return Err(e.into());
    }

    Ok(LinkOutcome::Replaced)
}

/// `symlink()` bracketed by the creation-label hooks, re-creating missing
/// parents (mode 0755) for as long as the kernel reports ENOENT
fn symlink_with_parents(target: &Path, link: &Path) -> io::Result<()> {
    loop {
        match mkdir_parents(link, 0o755) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        seclabel::prepare_label_for_creation(link, libc::S_IFLNK);
        let r = std::os::unix::fs::symlink(target, link);
        seclabel::clear_label_for_creation();

        match r {
            Ok(()) => return Ok(()),
            // parent vanished between mkdir and symlink
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Refresh the link's own timestamp without following it, best effort
fn touch_nofollow(path: &Path) {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            std::ptr::null(),
            libc::AT_SYMLINK_NOFOLLOW,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn disk(dev_dir: &Path) -> Device {
        Device {
            devpath: "/devices/pci0000:00/0000:00:10.0/block/sda".into(),
            subsystem: Some("block".into()),
            devname: Some(dev_dir.join("sda")),
            major: 8,
            minor: 0,
            devlink_priority: 0,
            devlinks: Vec::new(),
            is_initialized: true,
        }
    }

    #[test]
    fn test_create_then_preserve() {
        let tmp = tempfile::tempdir().unwrap();
        let dev_dir = tmp.path().join("dev");
        std::fs::create_dir_all(&dev_dir).unwrap();
        let dev = disk(&dev_dir);
        let slink = dev_dir.join("disk/by-label/ROOT");

        let node = dev_dir.join("sda");
        assert_eq!(
            node_symlink(&dev, &node, &slink).unwrap(),
            LinkOutcome::Created
        );
        assert_eq!(
            std::fs::read_link(&slink).unwrap(),
            PathBuf::from("../../sda")
        );

        assert_eq!(
            node_symlink(&dev, &node, &slink).unwrap(),
            LinkOutcome::Unchanged
        );
        assert_eq!(
            std::fs::read_link(&slink).unwrap(),
            PathBuf::from("../../sda")
        );
    }

    #[test]
    fn test_replace_wrong_target() {
        let tmp = tempfile::tempdir().unwrap();
        let dev_dir = tmp.path().join("dev");
        std::fs::create_dir_all(&dev_dir).unwrap();
        let dev = disk(&dev_dir);
        let slink = dev_dir.join("root");

        std::os::unix::fs::symlink("nonsense", &slink).unwrap();

        assert_eq!(
            node_symlink(&dev, &dev_dir.join("sda"), &slink).unwrap(),
            LinkOutcome::Replaced
        );
        assert_eq!(std::fs::read_link(&slink).unwrap(), PathBuf::from("sda"));
        // staging name must not linger
        assert!(!dev_dir.join("root.tmp-b8:0").exists());
    }

    #[test]
    fn test_replace_regular_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dev_dir = tmp.path().join("dev");
        std::fs::create_dir_all(&dev_dir).unwrap();
        let dev = disk(&dev_dir);
        let slink = dev_dir.join("root");

        std::fs::write(&slink, b"not a link").unwrap();

        assert_eq!(
            node_symlink(&dev, &dev_dir.join("sda"), &slink).unwrap(),
            LinkOutcome::Replaced
        );
        assert!(std::fs::symlink_metadata(&slink)
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn test_relative_targets_only() {
        let tmp = tempfile::tempdir().unwrap();
        let dev_dir = tmp.path().join("dev");
        std::fs::create_dir_all(&dev_dir).unwrap();
        let dev = disk(&dev_dir);

        let err = node_symlink(&dev, Path::new("sda"), &dev_dir.join("root")).unwrap_err();
        assert!(matches!(err, Error::BadPath(_)));
    }
}
