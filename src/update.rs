//! The link update fixpoint
//!
//! Racing workers may add and remove claims on the same stable link
//! concurrently. Publication is wrapped in a retry loop: observe the
//! claim index, pick the winner, publish, and re-observe. If the index
//! directory's identity changed across the publication, another worker
//! raced us and the loop runs again, up to a bounded budget.

use crate::config::LinkerConfig;
use crate::device::{Device, DeviceDb};
use crate::error::{Error, Result};
use crate::path::rmdir_parents;
use crate::stack::{add_claim, claim_dir, find_prioritized, remove_claim};
use crate::symlink::{node_symlink, LinkOutcome};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{debug, warn};

/// Publication retry budget for a device with a durable database record
pub const LINK_UPDATE_MAX_RETRIES: usize = 128;

/// Identity snapshot of the claim index directory. Two equal stamps
/// bracketing a publication mean no claim file was created or removed in
/// between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirStamp {
    dev: u64,
    ino: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    mtime_nsec: i64,
    ctime: i64,
    ctime_nsec: i64,
}

fn stamp_dir(dir: &Path) -> Result<Option<DirStamp>> {
    match std::fs::metadata(dir) {
        Ok(md) => Ok(Some(DirStamp {
            dev: md.dev(),
            ino: md.ino(),
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            size: md.size(),
            mtime: md.mtime(),
            mtime_nsec: md.mtime_nsec(),
            ctime: md.ctime(),
            ctime_nsec: md.ctime_nsec(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Add or drop `dev`'s claim on `slink` and drive the published symlink
/// to the current winner.
///
/// With no claimant left the link itself is retired along with its empty
/// parent directories. A publication that *replaced* an existing entry
/// always takes another round: the entry may have been a rival's view,
/// and the rival must get a chance to reassert. An uninitialized device
/// gets a single provisional round; the re-invocation after its record
/// lands repairs any miswinner.
pub fn link_update(
    config: &LinkerConfig,
    db: &DeviceDb,
    dev: &Device,
    slink: &Path,
    add: bool,
) -> Result<()> {
    let stackdir = claim_dir(config, slink)?;
    let claim_file = stackdir.join(dev.device_id());

    if add {
        add_claim(config, dev, slink)?;
    } else {
        remove_claim(config, dev, slink)?;
    }

    let retries = if dev.is_initialized {
        LINK_UPDATE_MAX_RETRIES
    } else {
        1
    };

    for _ in 0..retries {
        let before = stamp_dir(&stackdir)?;

        let target = match find_prioritized(db, dev, add, &stackdir) {
            Ok(target) => target,
            Err(Error::NoClaimant) => {
                debug!("No reference left, removing '{}'", slink.display());
                if std::fs::remove_file(slink).is_ok() {
                    rmdir_parents(slink, &config.dev_dir);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match node_symlink(dev, &target, slink) {
            Err(e) => {
                if add {
                    let _ = std::fs::remove_file(&claim_file);
                }
                return Err(e);
            }
            Ok(LinkOutcome::Replaced) => continue,
            Ok(_) => {
                // only a valid first stamp can prove quiescence; a
                // missing index directory always forces another round
                if let Some(before) = before {
                    if stamp_dir(&stackdir)? == Some(before) {
                        return Ok(());
                    }
                }
            }
        }
    }

    if retries == LINK_UPDATE_MAX_RETRIES {
        Err(Error::TooManyRetries(LINK_UPDATE_MAX_RETRIES))
    } else {
        Ok(())
    }
}

/// Retire the stable links a previous revision of this device held but
/// the current revision no longer declares. Per-link failures are
/// logged and do not stop the walk.
pub fn update_old_links(
    config: &LinkerConfig,
    db: &DeviceDb,
    dev: &Device,
    dev_old: &Device,
) -> Result<()> {
    for link in &dev_old.devlinks {
        if dev.devlinks.contains(link) {
            continue;
        }

        debug!(
            "Updating old name, '{}' no longer belonging to '{}'",
            link.display(),
            dev.devpath
        );
        if let Err(e) = link_update(config, db, dev, link, false) {
            warn!(
                "Failed to update device symlink '{}', ignoring: {}",
                link.display(),
                e
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(root: &Path) -> LinkerConfig {
        LinkerConfig {
            dev_dir: root.join("dev"),
            run_dir: root.join("run"),
        }
    }

    fn disk(config: &LinkerConfig, minor: u32, priority: i32) -> Device {
        Device {
            devpath: format!("/devices/virtual/block/sd{}", minor),
            subsystem: Some("block".into()),
            devname: Some(config.dev_dir.join(format!("sd{}", minor))),
            major: 8,
            minor,
            devlink_priority: priority,
            devlinks: Vec::new(),
            is_initialized: true,
        }
    }

    #[test]
    fn test_add_then_remove_single_claimant() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir_all(&config.dev_dir).unwrap();
        let db = DeviceDb::new(config.data_dir());

        let dev = disk(&config, 0, 0);
        db.store(&dev).unwrap();
        let slink = config.dev_dir.join("disk/by-label/ROOT");

        link_update(&config, &db, &dev, &slink, true).unwrap();
        assert_eq!(
            std::fs::read_link(&slink).unwrap(),
            PathBuf::from("../../sd0")
        );

        link_update(&config, &db, &dev, &slink, false).unwrap();
        assert!(!slink.exists());
        assert!(!config.dev_dir.join("disk").exists());
        assert!(!claim_dir(&config, &slink).unwrap().exists());
    }

    #[test]
    fn test_rejects_links_outside_dev_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let db = DeviceDb::new(config.data_dir());
        let dev = disk(&config, 0, 0);

        let err = link_update(&config, &db, &dev, Path::new("/tmp/ROOT"), true).unwrap_err();
        assert!(matches!(err, Error::BadPath(_)));
    }

    #[test]
    fn test_uninitialized_device_gets_one_provisional_round() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        std::fs::create_dir_all(&config.dev_dir).unwrap();
        let db = DeviceDb::new(config.data_dir());

        let mut dev = disk(&config, 0, 0);
        dev.is_initialized = false;
        let slink = config.dev_dir.join("root");

        // one round, no record in the database: still publishes and
        // still exits success
        link_update(&config, &db, &dev, &slink, true).unwrap();
        assert_eq!(std::fs::read_link(&slink).unwrap(), PathBuf::from("sd0"));
    }
}
